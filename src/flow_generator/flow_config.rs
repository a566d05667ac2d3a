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

use log::{debug, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::error::{Error, Result};
use crate::common::enums::IpProtocol;
use crate::common::flow::{FlowState, ProtoFreeFn, ProtoStateFn};
use crate::config::{ConfNode, Config};

pub const FLOW_DEFAULT_MEMCAP: u64 = 32 * 1024 * 1024;
pub const FLOW_DEFAULT_HASHSIZE: u32 = 65536;
pub const FLOW_DEFAULT_PREALLOC: u32 = 10000;
const FLOW_DEFAULT_EMERGENCY_RECOVERY: u8 = 30;
const FLOW_DEFAULT_PRUNE: u32 = 5;

// Timeouts in seconds, per protocol and flow state. A closed timeout of
// zero expires the flow on the next reclaimer visit.
pub const FLOW_DEFAULT_NEW_TIMEOUT: u32 = 30;
pub const FLOW_DEFAULT_EST_TIMEOUT: u32 = 300;
pub const FLOW_DEFAULT_CLOSED_TIMEOUT: u32 = 0;
pub const FLOW_DEFAULT_EMERG_NEW_TIMEOUT: u32 = 10;
pub const FLOW_DEFAULT_EMERG_EST_TIMEOUT: u32 = 100;
pub const FLOW_DEFAULT_EMERG_CLOSED_TIMEOUT: u32 = 0;
pub const FLOW_TCP_NEW_TIMEOUT: u32 = 60;
pub const FLOW_TCP_EST_TIMEOUT: u32 = 3600;
pub const FLOW_TCP_EMERG_NEW_TIMEOUT: u32 = 10;
pub const FLOW_TCP_EMERG_EST_TIMEOUT: u32 = 300;
pub const FLOW_UDP_NEW_TIMEOUT: u32 = 30;
pub const FLOW_UDP_EST_TIMEOUT: u32 = 300;
pub const FLOW_UDP_EMERG_NEW_TIMEOUT: u32 = 10;
pub const FLOW_UDP_EMERG_EST_TIMEOUT: u32 = 100;
pub const FLOW_ICMP_NEW_TIMEOUT: u32 = 30;
pub const FLOW_ICMP_EST_TIMEOUT: u32 = 300;
pub const FLOW_ICMP_EMERG_NEW_TIMEOUT: u32 = 10;
pub const FLOW_ICMP_EMERG_EST_TIMEOUT: u32 = 100;

/// Tuning knobs of the flow engine, read once from the configuration
/// store at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowConfig {
    /// Ceiling in bytes for all memory attributed to the flow engine.
    pub memcap: u64,
    pub hash_size: u32,
    /// Target length of the spare queue.
    pub prealloc: u32,
    /// Emergency mode ends when memory use sinks below
    /// `(100 - emergency_recovery)%` of memcap.
    pub emergency_recovery: u8,
    /// Upper bound of flows released per reclaimer pass.
    pub flow_try_release: u32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            memcap: FLOW_DEFAULT_MEMCAP,
            hash_size: FLOW_DEFAULT_HASHSIZE,
            prealloc: FLOW_DEFAULT_PREALLOC,
            emergency_recovery: FLOW_DEFAULT_EMERGENCY_RECOVERY,
            flow_try_release: FLOW_DEFAULT_PRUNE,
        }
    }
}

impl FlowConfig {
    pub fn load(conf: &Config) -> Result<Self> {
        let mut config = FlowConfig::default();

        match conf.get_int("flow.emergency-recovery") {
            Some(val @ 1..=100) => config.emergency_recovery = val as u8,
            Some(_) => warn!(
                "flow.emergency-recovery must be in the range of 1 and 100 (as percentage), using default {}",
                FLOW_DEFAULT_EMERGENCY_RECOVERY
            ),
            None => debug!("flow.emergency-recovery, using default value"),
        }

        match conf.get_int("flow.prune-flows") {
            Some(val) if val > 0 => config.flow_try_release = val as u32,
            Some(_) => warn!(
                "flow.prune-flows must be positive, using default {}",
                FLOW_DEFAULT_PRUNE
            ),
            None => debug!("flow.prune-flows, using default value"),
        }

        if let Some(val) = conf.get("flow.memcap") {
            config.memcap = parse_size(val).ok_or_else(|| Error::InvalidConfigValue {
                key: "flow.memcap",
                value: val.to_owned(),
            })?;
        }
        if let Some(val) = conf.get("flow.hash-size") {
            match val.parse::<u32>() {
                Ok(size) if size > 0 => config.hash_size = size,
                _ => debug!("ignoring unparsable flow.hash-size '{}'", val),
            }
        }
        if let Some(val) = conf.get("flow.prealloc") {
            match val.parse::<u32>() {
                Ok(count) if count > 0 => config.prealloc = count,
                _ => debug!("ignoring unparsable flow.prealloc '{}'", val),
            }
        }

        debug!(
            "flow config: memcap: {}, hash-size: {}, prealloc: {}",
            config.memcap, config.hash_size, config.prealloc
        );
        Ok(config)
    }
}

/// Dense projection of ip protocol numbers onto the per protocol policy
/// slots. Unknown protocols share the default slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FlowProto {
    Default = 0,
    Tcp = 1,
    Udp = 2,
    Icmp = 3,
}

pub const FLOW_PROTO_MAX: usize = 4;

impl From<IpProtocol> for FlowProto {
    fn from(proto: IpProtocol) -> Self {
        match proto {
            IpProtocol::Tcp => FlowProto::Tcp,
            IpProtocol::Udp => FlowProto::Udp,
            IpProtocol::Icmp => FlowProto::Icmp,
            _ => FlowProto::Default,
        }
    }
}

/// Policy for one protocol slot: the six timeouts plus the registered
/// protocol callbacks.
#[derive(Clone, Copy)]
pub struct FlowProtoEntry {
    pub new_timeout: u32,
    pub est_timeout: u32,
    pub closed_timeout: u32,
    pub emerg_new_timeout: u32,
    pub emerg_est_timeout: u32,
    pub emerg_closed_timeout: u32,
    pub free: Option<ProtoFreeFn>,
    pub get_state: Option<ProtoStateFn>,
}

impl FlowProtoEntry {
    const fn new(new: u32, est: u32, emerg_new: u32, emerg_est: u32) -> Self {
        FlowProtoEntry {
            new_timeout: new,
            est_timeout: est,
            closed_timeout: FLOW_DEFAULT_CLOSED_TIMEOUT,
            emerg_new_timeout: emerg_new,
            emerg_est_timeout: emerg_est,
            emerg_closed_timeout: FLOW_DEFAULT_EMERG_CLOSED_TIMEOUT,
            free: None,
            get_state: None,
        }
    }
}

/// Per protocol timeout and callback table. Written only while the engine
/// initializes, read without locks afterwards.
pub struct FlowProtoTable([FlowProtoEntry; FLOW_PROTO_MAX]);

impl Default for FlowProtoTable {
    fn default() -> Self {
        FlowProtoTable([
            FlowProtoEntry::new(
                FLOW_DEFAULT_NEW_TIMEOUT,
                FLOW_DEFAULT_EST_TIMEOUT,
                FLOW_DEFAULT_EMERG_NEW_TIMEOUT,
                FLOW_DEFAULT_EMERG_EST_TIMEOUT,
            ),
            FlowProtoEntry::new(
                FLOW_TCP_NEW_TIMEOUT,
                FLOW_TCP_EST_TIMEOUT,
                FLOW_TCP_EMERG_NEW_TIMEOUT,
                FLOW_TCP_EMERG_EST_TIMEOUT,
            ),
            FlowProtoEntry::new(
                FLOW_UDP_NEW_TIMEOUT,
                FLOW_UDP_EST_TIMEOUT,
                FLOW_UDP_EMERG_NEW_TIMEOUT,
                FLOW_UDP_EMERG_EST_TIMEOUT,
            ),
            FlowProtoEntry::new(
                FLOW_ICMP_NEW_TIMEOUT,
                FLOW_ICMP_EST_TIMEOUT,
                FLOW_ICMP_EMERG_NEW_TIMEOUT,
                FLOW_ICMP_EMERG_EST_TIMEOUT,
            ),
        ])
    }
}

impl FlowProtoTable {
    /// Builds the table from compile-time defaults, then applies the
    /// `flow-timeouts` subtree of the configuration.
    pub fn load(conf: &Config) -> Self {
        let mut table = FlowProtoTable::default();
        let Some(timeouts) = conf.get_node("flow-timeouts") else {
            return table;
        };

        if let Some(proto) = timeouts.lookup_child("default") {
            table.apply_node(FlowProto::Default, proto, true);
        }
        if let Some(proto) = timeouts.lookup_child("tcp") {
            table.apply_node(FlowProto::Tcp, proto, true);
        }
        // no closed state exists for udp and icmp
        if let Some(proto) = timeouts.lookup_child("udp") {
            table.apply_node(FlowProto::Udp, proto, false);
        }
        if let Some(proto) = timeouts.lookup_child("icmp") {
            table.apply_node(FlowProto::Icmp, proto, false);
        }
        table
    }

    fn apply_node(&mut self, proto: FlowProto, node: &ConfNode, with_closed: bool) {
        let entry = &mut self.0[proto as usize];
        apply_timeout(node, "new", &mut entry.new_timeout);
        apply_timeout(node, "established", &mut entry.est_timeout);
        apply_timeout(node, "emergency-new", &mut entry.emerg_new_timeout);
        apply_timeout(node, "emergency-established", &mut entry.emerg_est_timeout);
        if with_closed {
            apply_timeout(node, "closed", &mut entry.closed_timeout);
            apply_timeout(node, "emergency-closed", &mut entry.emerg_closed_timeout);
        }
    }

    pub fn entry(&self, proto: FlowProto) -> &FlowProtoEntry {
        &self.0[proto as usize]
    }

    /// Effective timeout for a flow in `state` under the current pressure
    /// regime.
    pub fn timeout(&self, proto: FlowProto, state: FlowState, emergency: bool) -> u32 {
        let entry = &self.0[proto as usize];
        match (emergency, state) {
            (false, FlowState::New) => entry.new_timeout,
            (false, FlowState::Established) => entry.est_timeout,
            (false, FlowState::Closed) => entry.closed_timeout,
            (true, FlowState::New) => entry.emerg_new_timeout,
            (true, FlowState::Established) => entry.emerg_est_timeout,
            (true, FlowState::Closed) => entry.emerg_closed_timeout,
        }
    }

    pub fn set_proto_timeout(&mut self, proto: IpProtocol, new: u32, est: u32, closed: u32) {
        let entry = &mut self.0[FlowProto::from(proto) as usize];
        entry.new_timeout = new;
        entry.est_timeout = est;
        entry.closed_timeout = closed;
    }

    pub fn set_proto_emergency_timeout(
        &mut self,
        proto: IpProtocol,
        new: u32,
        est: u32,
        closed: u32,
    ) {
        let entry = &mut self.0[FlowProto::from(proto) as usize];
        entry.emerg_new_timeout = new;
        entry.emerg_est_timeout = est;
        entry.emerg_closed_timeout = closed;
    }

    pub fn set_proto_free_func(&mut self, proto: IpProtocol, free: ProtoFreeFn) {
        self.0[FlowProto::from(proto) as usize].free = Some(free);
    }

    pub fn set_flow_state_func(&mut self, proto: IpProtocol, get_state: ProtoStateFn) {
        self.0[FlowProto::from(proto) as usize].get_state = Some(get_state);
    }
}

fn apply_timeout(node: &ConfNode, name: &str, slot: &mut u32) {
    if let Some(val) = node.lookup_child_value(name) {
        match val.parse::<u32>() {
            Ok(seconds) => *slot = seconds,
            Err(_) => debug!("ignoring unparsable flow timeout '{}' = '{}'", name, val),
        }
    }
}

// Size strings use binary units: "32mb" is 32 MiB. A bare number is a
// byte count.
fn parse_size(val: &str) -> Option<u64> {
    let s = val.trim().to_ascii_lowercase();
    let (num, multiplier) = if let Some(n) = s.strip_suffix("kb").or_else(|| s.strip_suffix("kib")) {
        (n, 1u64 << 10)
    } else if let Some(n) = s.strip_suffix("mb").or_else(|| s.strip_suffix("mib")) {
        (n, 1u64 << 20)
    } else if let Some(n) = s.strip_suffix("gb").or_else(|| s.strip_suffix("gib")) {
        (n, 1u64 << 30)
    } else if let Some(n) = s.strip_suffix('b') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };
    let num = num.trim_end();
    if num.is_empty() {
        return None;
    }
    let count: f64 = num.parse().ok()?;
    if !count.is_finite() || count < 0.0 {
        return None;
    }
    Some((count * multiplier as f64) as u64)
}
