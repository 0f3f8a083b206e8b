//! ISO/IEC 18013-5 structures used on the holder side of a presentation.

pub mod device_request;
pub mod device_response;
pub mod issuer_signed;

pub use device_request::{DeviceRequest, DocRequest, ItemsRequest};
pub use device_response::{device_response, UnsignedDocument};
pub use issuer_signed::IssuerSigned;
