mod config_tests;
mod execution_tests;
mod recovery_tests;
