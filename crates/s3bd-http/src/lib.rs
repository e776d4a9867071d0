//! Object-store HTTP layer for s3bd
//!
//! The bottom of the stack: maps block operations onto signed HTTP
//! requests against an S3-compatible bucket. One block, one object.
//! Payloads are optionally deflate-compressed and AES-CBC encrypted;
//! plaintext MD5 hashes and the transform markers ride along as object
//! metadata. Transient failures are retried with jittered exponential
//! backoff and never escape this crate.

pub mod client;
pub mod compress;
pub mod credentials;
pub mod encrypt;
pub mod keys;
pub mod list;
pub mod retry;
pub mod sign;

pub use client::{HttpStore, StoreParams};
pub use credentials::{Credentials, CredentialsProvider, IamRoleProvider, StaticCredentials};
pub use keys::KeyLayout;
pub use sign::RequestSigner;
