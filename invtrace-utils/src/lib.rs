//! Utility library for the invtrace project: capture decoding and capture directory handling.

pub mod pcap_utils;
