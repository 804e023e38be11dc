//! Integration tests for the botyard manager

mod fakes;
mod test_buildlog;
mod test_fsm;
mod test_registry;
mod test_scenarios;
mod test_transform;
mod test_variables;
