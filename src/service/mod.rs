pub mod face_service;
pub mod types;

pub use face_service::FaceService;
