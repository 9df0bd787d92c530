//! Debug Transport Module (DTM) handling.
//!
//! The DTM is responsible for access to the debug module.
//! Currently, only JTAG is supported.

pub mod jtag_dtm;
