//! Convert a single-slot Raspberry Pi style disk image into an A/B image.
//!
//! The output carries two symmetric boot+root slots and a shared home
//! partition that grows to fill the device on first boot:
//!
//! ```text
//! [try-boot] | boot A | root A | extended: boot B | root B | home
//! ```
//!
//! - **Geometry** - [`disk::geometry`] computes an immutable, validated
//!   [`disk::PartitionPlan`] from measurements of the original image
//! - **Devices** - [`disk::loopdev`] and [`disk::partitions`] attach images
//!   and write the msdos table through parted
//! - **Content** - [`disk::filesystems`], [`disk::migrate`] and
//!   [`disk::bootconfig`] format, copy and rewrite boot configuration
//! - **Cleanup** - [`teardown::Teardown`] releases every mount and loop
//!   device in reverse order, on success, failure or interruption
//!
//! # Example
//!
//! ```rust,ignore
//! use ab_image_builder::{config::Config, disk};
//! use std::sync::atomic::AtomicBool;
//!
//! let cancel = AtomicBool::new(false);
//! let report = disk::convert_image(
//!     "raspios.img".as_ref(),
//!     "raspios-ab.img".as_ref(),
//!     &Config::default(),
//!     &cancel,
//! )?;
//! println!("{} partitions", report.plan.entries().len());
//! ```

pub mod config;
pub mod disk;
pub mod error;
pub mod preflight;
pub mod process;
pub mod teardown;

pub use config::{Config, LayoutVariant, RootSelector};
pub use disk::{convert_image, convert_with_preflight, ConversionReport};
pub use error::ConvertError;
pub use process::Cmd;
pub use teardown::Teardown;
