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

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use super::enums::IpProtocol;

/// Endpoint view of a decoded packet, as the flow engine consumes it.
///
/// `timestamp` is wall clock time of capture. The two VLAN levels are part
/// of the flow tuple: a packet and its reply carry identical (not swapped)
/// VLAN identifiers.
#[derive(Clone, Debug)]
pub struct LookupKey {
    pub timestamp: Duration,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: IpProtocol,
    pub vlan_0: u16,
    pub vlan_1: u16,
}

impl Default for LookupKey {
    fn default() -> Self {
        LookupKey {
            timestamp: Duration::ZERO,
            src_ip: Ipv4Addr::UNSPECIFIED.into(),
            dst_ip: Ipv4Addr::UNSPECIFIED.into(),
            src_port: 0,
            dst_port: 0,
            proto: Default::default(),
            vlan_0: 0,
            vlan_1: 0,
        }
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}:{} > {}:{}, proto: {}, vlan: {}/{}",
            self.timestamp,
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.proto,
            self.vlan_0,
            self.vlan_1,
        )
    }
}
