//! Core packet types

pub mod packet;
