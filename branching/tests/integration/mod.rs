mod lifecycle_test;
mod retry_test;
mod session_test;
mod workers_test;
