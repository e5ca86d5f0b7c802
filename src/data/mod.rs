pub mod data_file;
pub mod file_set;
pub mod log_record;
