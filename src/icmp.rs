//! Component F: a passive ICMP receiver. Validates the whole-message
//! checksum and logs a human-readable summary; never replies.

use std::net::Ipv4Addr;

use log::{debug, error, trace};

use crate::checksum;

const HEADER_LEN: usize = 8;

const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_DEST_UNREACH: u8 = 3;
const TYPE_SOURCE_QUENCH: u8 = 4;
const TYPE_REDIRECT: u8 = 5;
const TYPE_ECHO: u8 = 8;
const TYPE_TIME_EXCEEDED: u8 = 11;
const TYPE_PARAM_PROBLEM: u8 = 12;
const TYPE_TIMESTAMP: u8 = 13;
const TYPE_TIMESTAMP_REPLY: u8 = 14;
const TYPE_INFO_REQUEST: u8 = 15;
const TYPE_INFO_REPLY: u8 = 16;

fn type_name(kind: u8) -> &'static str {
    match kind {
        TYPE_ECHO_REPLY => "EchoReply",
        TYPE_DEST_UNREACH => "DestinationUnreachable",
        TYPE_SOURCE_QUENCH => "SourceQuench",
        TYPE_REDIRECT => "Redirect",
        TYPE_ECHO => "Echo",
        TYPE_TIME_EXCEEDED => "TimeExceeded",
        TYPE_PARAM_PROBLEM => "ParameterProblem",
        TYPE_TIMESTAMP => "Timestamp",
        TYPE_TIMESTAMP_REPLY => "TimestampReply",
        TYPE_INFO_REQUEST => "InformationRequest",
        TYPE_INFO_REPLY => "InformationReply",
        _ => "Unknown",
    }
}

/// Validate and log one ICMP message as delivered by the IP layer's
/// protocol dispatch. Never emits a reply (spec §4.F).
pub fn on_message(src: Ipv4Addr, dst: Ipv4Addr, bytes: &[u8]) {
    if bytes.len() < HEADER_LEN {
        error!("icmp: too short ({} bytes)", bytes.len());
        return;
    }
    if !checksum::verify(&[bytes]) {
        error!("icmp: checksum error from {src}");
        return;
    }

    let kind = bytes[0];
    let code = bytes[1];
    let sum = u16::from_be_bytes([bytes[2], bytes[3]]);

    debug!("{src} => {dst}, len={}", bytes.len());
    trace!("       type: {kind} ({})", type_name(kind));
    trace!("       code: {code}");
    trace!("        sum: 0x{sum:04x}");

    match kind {
        TYPE_ECHO | TYPE_ECHO_REPLY => {
            let id = u16::from_be_bytes([bytes[4], bytes[5]]);
            let seq = u16::from_be_bytes([bytes[6], bytes[7]]);
            trace!("         id: {id}");
            trace!("        seq: {seq}");
        }
        TYPE_DEST_UNREACH => {
            let unused = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            trace!("     unused: {unused}");
        }
        _ => {
            let dep = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            trace!("        dep: 0x{dep:08x}");
        }
    }
}
