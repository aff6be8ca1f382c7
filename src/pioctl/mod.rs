//! The OpenAFS cache manager interface. The buffer formats are always built,
//! the system call itself needs the `openafs` feature.

pub mod wire;

#[cfg(feature = "openafs")]
mod syscall;

#[cfg(feature = "openafs")]
pub use syscall::Pioctl;
