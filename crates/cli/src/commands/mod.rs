pub mod ask;
pub mod doctor;
pub mod init;
pub mod schema;
pub mod serve;
pub mod services;

pub type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;
