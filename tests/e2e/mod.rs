mod process_worker_tests;
