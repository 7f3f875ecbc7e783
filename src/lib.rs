//! Library to backup [1C:Enterprise][1c] infobases.
//!
//! A backup drains the sessions of an infobase using the remote
//! administration client `rac`, dumps it with the designer into a `.dt`
//! file and uploads the dump onto an NFS or SMB share. The steps are
//! orchestrated in the [`backup`] module.
//!
//! [1c]: https://v8.1c.ru/

#![forbid(unsafe_code)]

pub mod backup;
pub mod cli;
pub mod dialog;
pub mod exec;
pub mod onec;
pub mod report;
pub mod settings;
pub mod share;
pub mod util;
