//! `volstack` error code.
//!
//! Every fallible operation in the crate returns [`VolResult`]. Errors carry
//! a kind (existence, validation, locking, backend, transport) plus a stack
//! of context strings appended as the error travels up through operations.

use thiserror::Error;

/// `volstack` result type.
pub type VolResult<T> = Result<T, VolError>;

/// `volstack` error code.
#[derive(Error, Debug)]
pub enum VolError {
    /// The record already exists.
    #[error("Already exists, context is {:#?}", .context)]
    Exists {
        /// Context of the error
        context: Vec<String>,
    },

    /// The record does not exist.
    #[error("Does not exist, context is {:#?}", .context)]
    NotExists {
        /// Context of the error
        context: Vec<String>,
    },

    /// A volume name or record failed validation.
    #[error("Invalid volume {:?}, context is {:#?}", .volume, .context)]
    InvalidVolume {
        /// Qualified volume name
        volume: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// A key could not be derived from (or parsed into) a record.
    #[error("Invalid db path, context is {:#?}", .context)]
    InvalidDbPath {
        /// Context of the error
        context: Vec<String>,
    },

    /// A stored value could not be decoded into its record type.
    #[error("Invalid db content, context is {:#?}", .context)]
    InvalidDbContent {
        /// Context of the error
        context: Vec<String>,
    },

    /// A lock could not be obtained, or a duplicate locked mount was seen.
    #[error("Lock failed, context is {:#?}", .context)]
    LockFailed {
        /// Context of the error
        context: Vec<String>,
    },

    /// In-band signal: the backend took no action and the caller need not
    /// perform further work for this step. Never surfaced to users.
    #[error("No action taken")]
    NoActionTaken,

    /// An argument was invalid.
    #[error("Argument is invalid, context is {:#?}", .context)]
    ArgumentInvalid {
        /// Context of the error
        context: Vec<String>,
    },

    /// The named driver is not registered.
    #[error("Could not locate driver {:?}, context is {:#?}", .driver, .context)]
    GetDriver {
        /// Driver name
        driver: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// The volume's policy carries no snapshot backend.
    #[error("Snapshots unsupported for {:?}, context is {:#?}", .volume, .context)]
    SnapshotsUnsupported {
        /// Qualified volume name
        volume: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Copy source and target collide, or the target is invalid.
    #[error("Cannot copy volume {:?}, context is {:#?}", .volume, .context)]
    CannotCopyVolume {
        /// Qualified volume name
        volume: String,
        /// Context of the error
        context: Vec<String>,
    },

    /// Copy request is missing the `snapshot` option.
    #[error("Missing snapshot option, context is {:#?}", .context)]
    MissingSnapshotOption {
        /// Context of the error
        context: Vec<String>,
    },

    /// Copy request is missing the `target` option.
    #[error("Missing target option, context is {:#?}", .context)]
    MissingTargetOption {
        /// Context of the error
        context: Vec<String>,
    },

    /// Volume creation failed at the backend.
    #[error("CreateVolume: {}, context is {:#?}", .source, .context)]
    CreateVolume {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Volume formatting failed at the backend.
    #[error("FormatVolume: {}, context is {:#?}", .source, .context)]
    FormatVolume {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Volume removal failed at the backend.
    #[error("RemoveVolume: {}, context is {:#?}", .source, .context)]
    RemoveVolume {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Mount failed at the backend.
    #[error("MountFailed: {}, context is {:#?}", .source, .context)]
    MountFailed {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Unmount failed at the backend.
    #[error("UnmountFailed: {}, context is {:#?}", .source, .context)]
    UnmountFailed {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Listing snapshots failed at the backend.
    #[error("ListSnapshots: {}, context is {:#?}", .source, .context)]
    ListSnapshots {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Taking a snapshot failed.
    #[error("SnapshotFailed: {}, context is {:#?}", .source, .context)]
    SnapshotFailed {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Persisting a volume record failed.
    #[error("PublishVolume: {}, context is {:#?}", .source, .context)]
    PublishVolume {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Persisting a policy record failed.
    #[error("PublishPolicy: {}, context is {:#?}", .source, .context)]
    PublishPolicy {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Persisting the global record failed.
    #[error("PublishGlobal: {}, context is {:#?}", .source, .context)]
    PublishGlobal {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Persisting a runtime-options record failed.
    #[error("PublishRuntime: {}, context is {:#?}", .source, .context)]
    PublishRuntime {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Reading an HTTP request body failed.
    #[error("ReadBody: {}, context is {:#?}", .source, .context)]
    ReadBody {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Decoding an HTTP request failed.
    #[error("UnmarshalRequest: {}, context is {:#?}", .source, .context)]
    UnmarshalRequest {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Encoding an HTTP response failed.
    #[error("MarshalResponse: {}, context is {:#?}", .source, .context)]
    MarshalResponse {
        /// Error source
        source: Box<VolError>,
        /// Context of the error
        context: Vec<String>,
    },

    /// Error caused by `etcd_client::Error`
    #[error("EtcdClientErr, the error is {:?}, context is {:#?}", .source, .context)]
    EtcdClientErr {
        /// Error source
        source: etcd_client::Error,
        /// Context of the error
        context: Vec<String>,
    },

    /// Error caused by `reqwest::Error`
    #[error("HttpClientErr, the error is {:?}, context is {:#?}", .source, .context)]
    HttpClientErr {
        /// Error source
        source: reqwest::Error,
        /// Context of the error
        context: Vec<String>,
    },

    /// Error caused by `serde_json::Error`
    #[error("SerdeJsonErr, the error is {:?}, context is {:#?}", .source, .context)]
    SerdeJsonErr {
        /// Error source
        source: serde_json::Error,
        /// Context of the error
        context: Vec<String>,
    },

    /// Error caused by `std::io::Error`
    #[error("IoErr, the error is {:?}, context is {:#?}", .source, .context)]
    IoErr {
        /// Error source
        source: std::io::Error,
        /// Context of the error
        context: Vec<String>,
    },
}

/// Add context to `VolResult`
pub trait Context<T, E> {
    /// Add context to `VolResult`
    fn add_context<C>(self, ctx: C) -> VolResult<T>
    where
        C: Into<String>;

    /// Add context to `VolResult` lazily
    fn with_context<C, F>(self, f: F) -> VolResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for Result<T, E>
where
    E: Into<VolError>,
{
    fn add_context<C>(self, ctx: C) -> VolResult<T>
    where
        C: Into<String>,
    {
        self.map_err(|e| e.into().add_context(ctx))
    }

    fn with_context<C, F>(self, f: F) -> VolResult<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.into().add_context(f()))
    }
}

impl VolError {
    /// Add context for `VolError`
    #[must_use]
    pub fn add_context<C>(mut self, ctx: C) -> Self
    where
        C: Into<String>,
    {
        macro_rules! append_context {
            ($context:ident, [$($target:ident),*]) => {
                match self {
                    $(Self::$target { ref mut context, .. } => {
                        context.push($context.into());
                    },)*
                    Self::NoActionTaken => {}
                }
            }
        }
        append_context!(
            ctx,
            [
                Exists,
                NotExists,
                InvalidVolume,
                InvalidDbPath,
                InvalidDbContent,
                LockFailed,
                ArgumentInvalid,
                GetDriver,
                SnapshotsUnsupported,
                CannotCopyVolume,
                MissingSnapshotOption,
                MissingTargetOption,
                CreateVolume,
                FormatVolume,
                RemoveVolume,
                MountFailed,
                UnmountFailed,
                ListSnapshots,
                SnapshotFailed,
                PublishVolume,
                PublishPolicy,
                PublishGlobal,
                PublishRuntime,
                ReadBody,
                UnmarshalRequest,
                MarshalResponse,
                EtcdClientErr,
                HttpClientErr,
                SerdeJsonErr,
                IoErr
            ]
        );
        self
    }

    /// Add context for `VolError` lazily
    #[must_use]
    pub fn with_context<C, F>(self, f: F) -> Self
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.add_context(f())
    }

    /// The wrapped cause, for kinds that chain one.
    fn cause(&self) -> Option<&VolError> {
        match *self {
            Self::CreateVolume { ref source, .. }
            | Self::FormatVolume { ref source, .. }
            | Self::RemoveVolume { ref source, .. }
            | Self::MountFailed { ref source, .. }
            | Self::UnmountFailed { ref source, .. }
            | Self::ListSnapshots { ref source, .. }
            | Self::SnapshotFailed { ref source, .. }
            | Self::PublishVolume { ref source, .. }
            | Self::PublishPolicy { ref source, .. }
            | Self::PublishGlobal { ref source, .. }
            | Self::PublishRuntime { ref source, .. }
            | Self::ReadBody { ref source, .. }
            | Self::UnmarshalRequest { ref source, .. }
            | Self::MarshalResponse { ref source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether this error (or any wrapped cause) is `Exists`.
    #[must_use]
    pub fn is_exists(&self) -> bool {
        match *self {
            Self::Exists { .. } => true,
            _ => self.cause().is_some_and(VolError::is_exists),
        }
    }

    /// Whether this error (or any wrapped cause) is `NotExists`.
    #[must_use]
    pub fn is_not_exists(&self) -> bool {
        match *self {
            Self::NotExists { .. } => true,
            _ => self.cause().is_some_and(VolError::is_not_exists),
        }
    }

    /// Whether this error is the `NoActionTaken` sentinel.
    #[must_use]
    pub fn is_no_action_taken(&self) -> bool {
        matches!(*self, Self::NoActionTaken)
    }

    /// Build an `Exists` error.
    #[must_use]
    pub fn exists<C: Into<String>>(ctx: C) -> Self {
        Self::Exists {
            context: vec![ctx.into()],
        }
    }

    /// Build a `NotExists` error.
    #[must_use]
    pub fn not_exists<C: Into<String>>(ctx: C) -> Self {
        Self::NotExists {
            context: vec![ctx.into()],
        }
    }

    /// Build an `InvalidVolume` error.
    #[must_use]
    pub fn invalid_volume<V: Into<String>>(volume: V) -> Self {
        Self::InvalidVolume {
            volume: volume.into(),
            context: vec![],
        }
    }

    /// Build an `InvalidDbPath` error.
    #[must_use]
    pub fn invalid_db_path<C: Into<String>>(ctx: C) -> Self {
        Self::InvalidDbPath {
            context: vec![ctx.into()],
        }
    }

    /// Build an `InvalidDbContent` error.
    #[must_use]
    pub fn invalid_db_content<C: Into<String>>(ctx: C) -> Self {
        Self::InvalidDbContent {
            context: vec![ctx.into()],
        }
    }

    /// Build a `LockFailed` error.
    #[must_use]
    pub fn lock_failed<C: Into<String>>(ctx: C) -> Self {
        Self::LockFailed {
            context: vec![ctx.into()],
        }
    }

    /// Build an `ArgumentInvalid` error.
    #[must_use]
    pub fn argument_invalid<C: Into<String>>(ctx: C) -> Self {
        Self::ArgumentInvalid {
            context: vec![ctx.into()],
        }
    }

    /// Build a `GetDriver` error.
    #[must_use]
    pub fn get_driver<D: Into<String>>(driver: D) -> Self {
        Self::GetDriver {
            driver: driver.into(),
            context: vec![],
        }
    }
}

macro_rules! implement_wrap {
    ($fun:ident, $target:ident) => {
        impl VolError {
            /// Wrap a cause into the corresponding operation error.
            #[must_use]
            pub fn $fun(source: VolError) -> Self {
                Self::$target {
                    source: Box::new(source),
                    context: vec![],
                }
            }
        }
    };
}
implement_wrap!(create_volume, CreateVolume);
implement_wrap!(format_volume, FormatVolume);
implement_wrap!(remove_volume, RemoveVolume);
implement_wrap!(mount_failed, MountFailed);
implement_wrap!(unmount_failed, UnmountFailed);
implement_wrap!(list_snapshots, ListSnapshots);
implement_wrap!(snapshot_failed, SnapshotFailed);
implement_wrap!(publish_volume, PublishVolume);
implement_wrap!(publish_policy, PublishPolicy);
implement_wrap!(publish_global, PublishGlobal);
implement_wrap!(publish_runtime, PublishRuntime);
implement_wrap!(read_body, ReadBody);
implement_wrap!(unmarshal_request, UnmarshalRequest);
implement_wrap!(marshal_response, MarshalResponse);

macro_rules! implement_from {
    ($source:path, $target:ident) => {
        impl From<$source> for VolError {
            fn from(error: $source) -> Self {
                Self::$target {
                    source: error,
                    context: vec![],
                }
            }
        }
    };
}
implement_from!(std::io::Error, IoErr);
implement_from!(etcd_client::Error, EtcdClientErr);
implement_from!(reqwest::Error, HttpClientErr);
implement_from!(serde_json::Error, SerdeJsonErr);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kind_survives_wrapping() {
        let err = VolError::remove_volume(VolError::not_exists("backend artifact gone"));
        assert!(err.is_not_exists());
        assert!(!err.is_exists());

        let err = VolError::publish_volume(VolError::exists("lost the create race"));
        assert!(err.is_exists());
        assert!(!err.is_not_exists());
    }

    #[test]
    fn test_context_accumulates() {
        let err = VolError::lock_failed("first").add_context("second");
        match err {
            VolError::LockFailed { context } => assert_eq!(context, vec!["first", "second"]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_no_action_taken_sentinel() {
        let err = VolError::NoActionTaken.add_context("ignored");
        assert!(err.is_no_action_taken());
    }
}
