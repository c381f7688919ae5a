pub mod list_files;
pub mod read_file;
pub mod upload_file;

pub use list_files::{CatalogEntry, ListFilesOperation};
pub use read_file::{
    ReadFileOperation, ReadFileOperationOutcome, ReadFileOperationRequest,
    ReadFileOperationResult, RetrievalMode, attachment_disposition, encode_uri_component,
    inline_disposition, mime_type_for,
};
pub use upload_file::{StoredFile, UploadFileOperation, UploadFileOperationRequest};
