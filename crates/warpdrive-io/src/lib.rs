//! Subject-directory I/O for warp correction.
//!
//! Resolves legacy and BIDS subject layouts, reads and writes displacement
//! fields and label volumes, migrates composite warps, and persists approval
//! metadata and correction sessions.

pub mod approval;
pub mod layout;
pub mod markups;
pub mod mat5;
#[cfg(feature = "mat73")]
pub mod mat73;
pub mod migrate;
pub mod nifti_io;
pub mod session;

pub use approval::{load_approval_state, set_approved};
pub use layout::{LayoutKind, MetadataFormat, SubjectPaths};
pub use markups::ControlPoint;
pub use migrate::update_legacy_transform_format;
pub use nifti_io::{read_displacement_field, read_grid_geometry, write_displacement_field};
pub use session::{
    discard_session, load_session, save_session, CorrectionSession, NodeData, NodeTag, SessionNode,
};
