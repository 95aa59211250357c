//! Built-in protocol definitions.
//!
//! Offsets are header-local: a definition describes one header starting at
//! byte 0, so callers slice the buffer at the layer boundary before
//! parsing (an IPv4 definition applied to a full Ethernet frame should be
//! given `&frame[14..]`).

use crate::field::{FieldConstraint, FieldDefinition, ProtocolDefinition};
use std::sync::Arc;

pub fn ethernet() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("ethernet", "1.0");
    p.description = "Ethernet II frame header".to_string();
    p.add_field(FieldDefinition::mac("destination_mac", 0).describe("Destination MAC address"));
    p.add_field(FieldDefinition::mac("source_mac", 6).describe("Source MAC address"));
    p.add_field(FieldDefinition::u16("ethertype", 12).describe("EtherType"));
    p
}

pub fn ipv4() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("ipv4", "1.0");
    p.description = "IPv4 header".to_string();
    p.add_field(FieldDefinition::u8("version_ihl", 0).describe("Version and header length"));
    p.add_field(FieldDefinition::u8("tos", 1).describe("Type of service"));
    p.add_field(FieldDefinition::u16("total_length", 2).describe("Total length"));
    p.add_field(FieldDefinition::u16("identification", 4).describe("Identification"));
    p.add_field(FieldDefinition::u16("flags_fragment", 6).describe("Flags and fragment offset"));
    p.add_field(FieldDefinition::u8("ttl", 8).describe("Time to live"));
    p.add_field(FieldDefinition::u8("protocol", 9).describe("Transport protocol number"));
    p.add_field(FieldDefinition::u16("checksum", 10).describe("Header checksum"));
    p.add_field(FieldDefinition::ipv4("source_ip", 12).describe("Source address"));
    p.add_field(FieldDefinition::ipv4("destination_ip", 16).describe("Destination address"));
    p.with_validator(Arc::new(verify_ipv4_checksum))
}

/// RFC 1071 ones-complement sum over the IPv4 header must be 0xffff.
fn verify_ipv4_checksum(buffer: &[u8]) -> bool {
    if buffer.len() < 20 {
        return false;
    }
    let ihl = (buffer[0] & 0x0f) as usize * 4;
    if ihl < 20 || buffer.len() < ihl {
        return false;
    }
    let mut sum = 0u32;
    for chunk in buffer[..ihl].chunks(2) {
        let word = u16::from_be_bytes([chunk[0], *chunk.get(1).unwrap_or(&0)]);
        sum += word as u32;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum == 0xffff
}

pub fn ipv6() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("ipv6", "1.0");
    p.description = "IPv6 header".to_string();
    p.add_field(
        FieldDefinition::u32("version_class_flow", 0)
            .describe("Version, traffic class and flow label"),
    );
    p.add_field(FieldDefinition::u16("payload_length", 4).describe("Payload length"));
    p.add_field(FieldDefinition::u8("next_header", 6).describe("Next header"));
    p.add_field(FieldDefinition::u8("hop_limit", 7).describe("Hop limit"));
    p.add_field(FieldDefinition::ipv6("source_ip", 8).describe("Source address"));
    p.add_field(FieldDefinition::ipv6("destination_ip", 24).describe("Destination address"));
    p
}

pub fn tcp() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("tcp", "1.0");
    p.description = "TCP header".to_string();
    p.add_field(FieldDefinition::u16("source_port", 0).describe("Source port"));
    p.add_field(FieldDefinition::u16("destination_port", 2).describe("Destination port"));
    p.add_field(FieldDefinition::u32("sequence_number", 4).describe("Sequence number"));
    p.add_field(FieldDefinition::u32("acknowledgment_number", 8).describe("Acknowledgment number"));
    p.add_field(FieldDefinition::u8("data_offset", 12).describe("Data offset and reserved bits"));
    p.add_field(FieldDefinition::u8("flags", 13).describe("Control flags"));
    p.add_field(FieldDefinition::u16("window_size", 14).describe("Receive window"));
    p.add_field(FieldDefinition::u16("checksum", 16).describe("Checksum"));
    p.add_field(FieldDefinition::u16("urgent_pointer", 18).describe("Urgent pointer"));
    p
}

pub fn udp() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("udp", "1.0");
    p.description = "UDP header".to_string();
    p.add_field(FieldDefinition::u16("source_port", 0).describe("Source port"));
    p.add_field(FieldDefinition::u16("destination_port", 2).describe("Destination port"));
    p.add_field(FieldDefinition::u16("length", 4).describe("Datagram length"));
    p.add_field(FieldDefinition::u16("checksum", 6).describe("Checksum"));
    p
}

pub fn icmp() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("icmp", "1.0");
    p.description = "ICMP header".to_string();
    p.add_field(FieldDefinition::u8("type", 0).describe("Message type"));
    p.add_field(FieldDefinition::u8("code", 1).describe("Message code"));
    p.add_field(FieldDefinition::u16("checksum", 2).describe("Checksum"));
    p.add_field(FieldDefinition::u16("identifier", 4).describe("Identifier"));
    p.add_field(FieldDefinition::u16("sequence_number", 6).describe("Sequence number"));
    p
}

pub fn arp() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("arp", "1.0");
    p.description = "ARP message".to_string();
    p.add_field(FieldDefinition::u16("hardware_type", 0).describe("Hardware type"));
    p.add_field(FieldDefinition::u16("protocol_type", 2).describe("Protocol type"));
    p.add_field(FieldDefinition::u8("hardware_length", 4).describe("Hardware address length"));
    p.add_field(FieldDefinition::u8("protocol_length", 5).describe("Protocol address length"));
    p.add_field(
        FieldDefinition::u16("operation", 6)
            .describe("Operation")
            .constrain(FieldConstraint::range(1, 2)),
    );
    p.add_field(FieldDefinition::mac("sender_mac", 8).describe("Sender hardware address"));
    p.add_field(FieldDefinition::ipv4("sender_ip", 14).describe("Sender protocol address"));
    p.add_field(FieldDefinition::mac("target_mac", 18).describe("Target hardware address"));
    p.add_field(FieldDefinition::ipv4("target_ip", 24).describe("Target protocol address"));
    p
}

pub fn vlan() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("vlan", "1.0");
    p.description = "802.1Q tag".to_string();
    p.add_field(FieldDefinition::u16("tci", 0).describe("Priority, DEI and VLAN id"));
    p.add_field(FieldDefinition::u16("ethertype", 2).describe("Encapsulated EtherType"));
    p
}

pub fn mpls() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("mpls", "1.0");
    p.description = "MPLS label stack entry".to_string();
    p.add_field(
        FieldDefinition::u32("label_stack_entry", 0)
            .describe("Label, traffic class, bottom-of-stack and TTL"),
    );
    p
}

pub fn dns() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("dns", "1.0");
    p.description = "DNS message header".to_string();
    p.add_field(FieldDefinition::u16("transaction_id", 0).describe("Transaction id"));
    p.add_field(FieldDefinition::u16("flags", 2).describe("Flags and response code"));
    p.add_field(FieldDefinition::u16("question_count", 4).describe("Questions"));
    p.add_field(FieldDefinition::u16("answer_count", 6).describe("Answer records"));
    p.add_field(FieldDefinition::u16("authority_count", 8).describe("Authority records"));
    p.add_field(FieldDefinition::u16("additional_count", 10).describe("Additional records"));
    p
}

pub fn http_request() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("http_request", "1.0");
    p.description = "HTTP request head, fixed-width view".to_string();
    p.add_field(FieldDefinition::string("method", 0, 10).describe("Request method"));
    p.add_field(
        FieldDefinition::string("uri", 10, 100)
            .optional()
            .describe("Request URI"),
    );
    p.add_field(
        FieldDefinition::string("version", 110, 10)
            .optional()
            .describe("HTTP version"),
    );
    p
}

pub fn http_response() -> ProtocolDefinition {
    let mut p = ProtocolDefinition::new("http_response", "1.0");
    p.description = "HTTP response head, fixed-width view".to_string();
    p.add_field(FieldDefinition::string("version", 0, 10).describe("HTTP version"));
    p.add_field(FieldDefinition::u16("status_code", 10).describe("Status code"));
    p.add_field(
        FieldDefinition::string("reason_phrase", 12, 50)
            .optional()
            .describe("Reason phrase"),
    );
    p
}

/// Every built-in definition, in registration order.
pub fn all() -> Vec<ProtocolDefinition> {
    vec![
        ethernet(),
        ipv4(),
        ipv6(),
        tcp(),
        udp(),
        icmp(),
        arp(),
        vlan(),
        mpls(),
        dns(),
        http_request(),
        http_response(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_lengths() {
        assert_eq!(ethernet().total_length(), 14);
        assert_eq!(ipv4().total_length(), 20);
        assert_eq!(ipv6().total_length(), 40);
        assert_eq!(tcp().total_length(), 20);
        assert_eq!(udp().total_length(), 8);
        assert_eq!(arp().total_length(), 28);
    }

    #[test]
    fn test_ipv4_checksum_validator() {
        // Header with a correct checksum (0xb1e6).
        let mut header = vec![
            0x45, 0x00, 0x00, 0x28, 0x00, 0x01, 0x00, 0x00, 0x40, 0x06, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x01, 0x0a, 0x00, 0x00, 0x02,
        ];
        let sum = checksum_of(&header);
        header[10] = (sum >> 8) as u8;
        header[11] = sum as u8;
        assert!(verify_ipv4_checksum(&header));

        header[11] ^= 0xff;
        assert!(!verify_ipv4_checksum(&header));
    }

    fn checksum_of(header: &[u8]) -> u16 {
        let mut sum = 0u32;
        for chunk in header.chunks(2) {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }
}
