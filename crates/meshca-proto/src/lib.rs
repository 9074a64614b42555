//! Protocol buffer definitions for the meshca certificate service.
//!
//! Workloads call `CreateCertificate` with a PEM CSR and receive a leaf
//! signed by the active authority together with every trusted authority
//! certificate. The schema is internal to meshca and carries no
//! compatibility promise.
//!
//! [`FILE_DESCRIPTOR_SET`] feeds gRPC server reflection.
//!
//! ```rust,ignore
//! use meshca_proto::CertificateRequest;
//!
//! let request = CertificateRequest {
//!     csr: csr_pem,
//!     kind: "sidecar".to_string(),
//! };
//! ```

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Generated protobuf types from certificate.proto
pub mod certificate {
    /// Pre-release version of the certificate API
    pub mod v1alpha1 {
        tonic::include_proto!("meshca.v1alpha1");
    }
}

pub use certificate::v1alpha1::*;

/// Encoded descriptor set for server reflection
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("meshca_descriptor");
