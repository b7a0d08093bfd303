pub mod upload;

pub use upload::UploadArchiveCommand;
