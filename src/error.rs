use thiserror::Error;

/// User-visible failure kinds. Operations bubble these up inside `anyhow`
/// chains so the driver can branch on the kind while keeping the context
/// trail intact.
#[derive(Debug, Error)]
pub enum OpError {
	/// The selected device index vanished; re-enumerate and retry.
	#[error("Selected device is no longer present")]
	NoDevice,
	/// Another process holds the device open.
	#[error("Access to the device was denied")]
	AccessDenied,
	/// A sharing conflict prevented exclusive access.
	#[error("The device is in use by another process")]
	Sharing,
	/// Read or write failure below the partition layer.
	#[error("Media failure: {0}")]
	BadMedia(String),
	/// The OS or the geometry checks refused the requested layout.
	#[error("Drive layout was refused: {0}")]
	LayoutRefuses(String),
	/// The volume did not come back after a format; the drive is left
	/// inaccessible and the user must replug it.
	#[error("Volume could not be remounted")]
	RemountFailed,
	/// User abort. No corruption is guaranteed only if the layout was not
	/// written yet.
	#[error("Operation cancelled")]
	Cancelled,
	/// Bug or kernel inconsistency.
	#[error("Internal error: {0}")]
	Internal(String),
}
