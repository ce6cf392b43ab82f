pub(crate) mod grading_jobs;
