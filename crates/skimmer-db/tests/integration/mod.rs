mod common;
mod content_tests;
mod job_queue_tests;
mod limiter_store_tests;
