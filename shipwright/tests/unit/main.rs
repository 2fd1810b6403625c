mod harness;
mod test_app;
mod test_fsm;
mod test_orchestrator;
