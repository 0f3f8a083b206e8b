pub mod cbor;
pub mod claim_request;
pub mod cose_key;
pub mod hpke;
pub mod jwe;
pub mod jws;
pub mod session_transcript;
pub mod util;
pub mod verifier;
