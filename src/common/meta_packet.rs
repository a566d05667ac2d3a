/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::mem::swap;
use std::net::IpAddr;
use std::time::Duration;

use super::enums::IpProtocol;
use super::flow::{FlowRef, PacketFlowFlags};
use super::lookup_key::LookupKey;

// ICMPv4 message types that embed another packet instead of being part of
// a conversation of their own.
const ICMPV4_DEST_UNREACH: u8 = 3;
const ICMPV4_SOURCE_QUENCH: u8 = 4;
const ICMPV4_REDIRECT: u8 = 5;
const ICMPV4_TIME_EXCEEDED: u8 = 11;
const ICMPV4_PARAMETER_PROBLEM: u8 = 12;

/// What the decoder hands to the flow engine for every packet. The engine
/// fills in `flow` and `flow_flags`.
#[derive(Default)]
pub struct MetaPacket {
    pub lookup_key: LookupKey,
    pub packet_len: usize,
    /// Valid for ICMP packets only.
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub flow: Option<FlowRef>,
    pub flow_flags: PacketFlowFlags,
}

impl MetaPacket {
    pub fn new(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        proto: IpProtocol,
    ) -> Self {
        MetaPacket {
            lookup_key: LookupKey {
                src_ip,
                dst_ip,
                src_port,
                dst_port,
                proto,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: Duration) -> Self {
        self.lookup_key.timestamp = timestamp;
        self
    }

    /// ICMPv4 error messages do not stand for traffic of the embedded
    /// conversation and must not update its seen flags.
    pub fn is_icmpv4_error(&self) -> bool {
        self.lookup_key.proto == IpProtocol::Icmp
            && matches!(
                self.icmp_type,
                ICMPV4_DEST_UNREACH
                    | ICMPV4_SOURCE_QUENCH
                    | ICMPV4_REDIRECT
                    | ICMPV4_TIME_EXCEEDED
                    | ICMPV4_PARAMETER_PROBLEM
            )
    }

    pub fn flow(&self) -> Option<&FlowRef> {
        self.flow.as_ref()
    }

    /// Drops the flow attachment, releasing the packet's retention claim.
    pub fn release_flow(&mut self) {
        self.flow = None;
        self.flow_flags = PacketFlowFlags::empty();
    }

    /// Turns the packet into its reverse direction twin.
    pub fn reverse(&mut self) {
        let key = &mut self.lookup_key;
        swap(&mut key.src_ip, &mut key.dst_ip);
        swap(&mut key.src_port, &mut key.dst_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icmpv4_error_detection() {
        let mut packet = MetaPacket::new(
            "192.168.1.1".parse().unwrap(),
            0,
            "192.168.1.2".parse().unwrap(),
            0,
            IpProtocol::Icmp,
        );
        packet.icmp_type = 8; // echo request
        assert!(!packet.is_icmpv4_error());
        packet.icmp_type = ICMPV4_DEST_UNREACH;
        assert!(packet.is_icmpv4_error());
        packet.icmp_type = ICMPV4_TIME_EXCEEDED;
        assert!(packet.is_icmpv4_error());

        // the type field means nothing for other protocols
        packet.lookup_key.proto = IpProtocol::Udp;
        assert!(!packet.is_icmpv4_error());
    }

    #[test]
    fn reverse_swaps_endpoints() {
        let mut packet = MetaPacket::new(
            "10.0.0.1".parse().unwrap(),
            1000,
            "10.0.0.2".parse().unwrap(),
            80,
            IpProtocol::Tcp,
        );
        packet.reverse();
        assert_eq!(packet.lookup_key.src_port, 80);
        assert_eq!(packet.lookup_key.dst_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }
}
