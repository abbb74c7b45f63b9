pub mod errors;
pub mod model;
pub mod repository;
pub mod service;
pub mod storage;

pub use errors::{TransitionError, UploadError};
pub use model::{FileRecord, FileState, NewFile};
pub use repository::FileRepository;
pub use service::FileService;
pub use storage::{FileStorage, LocalFileStorage, StorageError};
