pub mod layout;
pub mod lock;
pub mod record;
pub mod settings;
