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

use std::any::Any;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::Deref;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};

use super::enums::IpProtocol;
use super::lookup_key::LookupKey;

/// Protocol specific state owned by a flow, e.g. a TCP session. Freed
/// through the free function registered for the flow's protocol.
pub type ProtoCtx = Box<dyn Any + Send>;

/// Releases a `ProtoCtx` without freeing the flow itself.
pub type ProtoFreeFn = fn(ProtoCtx);

/// Derives the flow state from the protocol context.
pub type ProtoStateFn = fn(&(dyn Any + Send)) -> FlowState;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FlowFlags: u16 {
        /// Packets seen in the to-server direction.
        const TO_DST_SEEN = 0x0001;
        /// Packets seen in the to-client direction.
        const TO_SRC_SEEN = 0x0002;
        const TOSERVER_IPONLY_SET = 0x0004;
        const TOCLIENT_IPONLY_SET = 0x0008;
        const NOPACKET_INSPECTION = 0x0010;
        const NOPAYLOAD_INSPECTION = 0x0020;
        /// Flow was created while the engine was in emergency mode.
        const EMERGENCY = 0x0040;
    }

    /// Flow related flags attached to a packet by `handle_packet`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlowFlags: u8 {
        const TO_SERVER = 0x01;
        const TO_CLIENT = 0x02;
        const ESTABLISHED = 0x04;
        const HAS_FLOW = 0x08;
        const NOPACKET_INSPECTION = 0x10;
        const NOPAYLOAD_INSPECTION = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    /// Same direction as the packet that created the flow.
    ClientToServer,
    ServerToClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    New,
    Established,
    Closed,
}

/// Canonical flow tuple. Orientation is fixed by the first packet of the
/// conversation and never mutates while the flow is linked in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: IpProtocol,
    pub vlan_0: u16,
    pub vlan_1: u16,
}

impl Default for FlowKey {
    fn default() -> Self {
        FlowKey {
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

impl FlowKey {
    pub fn from_packet(key: &LookupKey) -> Self {
        FlowKey {
            src_ip: key.src_ip,
            dst_ip: key.dst_ip,
            src_port: key.src_port,
            dst_port: key.dst_port,
            proto: key.proto,
            vlan_0: key.vlan_0,
            vlan_1: key.vlan_1,
        }
    }

    /// Compares the packet tuple against this key in both orientations.
    pub fn matches(&self, key: &LookupKey) -> Option<PacketDirection> {
        if self.proto != key.proto || self.vlan_0 != key.vlan_0 || self.vlan_1 != key.vlan_1 {
            return None;
        }
        if self.src_ip == key.src_ip
            && self.dst_ip == key.dst_ip
            && self.src_port == key.src_port
            && self.dst_port == key.dst_port
        {
            Some(PacketDirection::ClientToServer)
        } else if self.src_ip == key.dst_ip
            && self.dst_ip == key.src_ip
            && self.src_port == key.dst_port
            && self.dst_port == key.src_port
        {
            Some(PacketDirection::ServerToClient)
        } else {
            None
        }
    }
}

/// Per conversation state. All fields mutate only under the owning
/// `FlowNode`'s lock; the tuple additionally never mutates while the flow
/// is linked in a bucket.
#[derive(Default)]
pub struct Flow {
    pub key: FlowKey,
    /// Timestamp of the most recently observed packet, seconds resolution.
    pub lastts: Duration,
    pub flags: FlowFlags,
    pub protoctx: Option<ProtoCtx>,
    pub appctx: Option<ProtoCtx>,
}

impl Flow {
    pub(crate) fn init(&mut self, key: FlowKey, emergency: bool) {
        self.key = key;
        self.lastts = Duration::ZERO;
        self.flags = if emergency {
            FlowFlags::EMERGENCY
        } else {
            FlowFlags::empty()
        };
        self.protoctx = None;
        self.appctx = None;
    }

    /// Clears the flow for reuse: the protocol context goes through the
    /// registered free function, everything else resets. Idempotent.
    pub(crate) fn clear(&mut self, free: Option<ProtoFreeFn>) {
        if let Some(ctx) = self.protoctx.take() {
            match free {
                Some(f) => f(ctx),
                None => drop(ctx),
            }
        }
        self.appctx = None;
        self.key = FlowKey::default();
        self.lastts = Duration::ZERO;
        self.flags = FlowFlags::empty();
    }

    /// Direction of `key` relative to this flow. For the port carrying
    /// protocols the ports decide unless they are equal; ICMP compares
    /// addresses only; everything else defaults to to-server.
    pub fn packet_direction(&self, key: &LookupKey) -> PacketDirection {
        match key.proto {
            IpProtocol::Tcp | IpProtocol::Udp | IpProtocol::Sctp => {
                if key.src_port != key.dst_port {
                    if self.key.src_port == key.src_port {
                        PacketDirection::ClientToServer
                    } else {
                        PacketDirection::ServerToClient
                    }
                } else if self.key.src_ip == key.src_ip {
                    PacketDirection::ClientToServer
                } else {
                    PacketDirection::ServerToClient
                }
            }
            IpProtocol::Icmp | IpProtocol::Icmpv6 => {
                if self.key.src_ip == key.src_ip {
                    PacketDirection::ClientToServer
                } else {
                    PacketDirection::ServerToClient
                }
            }
            _ => PacketDirection::ClientToServer,
        }
    }

    /// Flow state as the reclaimer sees it: the registered per protocol
    /// callback when one applies, the seen-bits heuristic otherwise.
    pub fn state(&self, get_state: Option<ProtoStateFn>) -> FlowState {
        if let Some(f) = get_state {
            if let Some(ctx) = self.protoctx.as_ref() {
                return f(ctx.as_ref());
            }
        }
        if self
            .flags
            .contains(FlowFlags::TO_DST_SEEN | FlowFlags::TO_SRC_SEEN)
        {
            FlowState::Established
        } else {
            FlowState::New
        }
    }

    /// Tears down application layer state. Rust destructors replace the
    /// parser cleanup callback of a classical engine.
    pub fn cleanup_app_layer(&mut self) {
        self.appctx = None;
    }
}

/// The shared flow unit: refcount for out-of-pipeline retention plus the
/// lock guarding the record. Stored as `Arc<FlowNode>` in exactly one of
/// a hash bucket or the spare queue.
pub struct FlowNode {
    use_cnt: AtomicU32,
    flow: Mutex<Flow>,
}

impl FlowNode {
    pub(crate) fn new() -> Self {
        FlowNode {
            use_cnt: AtomicU32::new(0),
            flow: Mutex::new(Flow::default()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Flow> {
        self.flow.lock()
    }

    // The reclaimer must never block on a flow lock held by a worker.
    pub(crate) fn try_lock(&self) -> Option<MutexGuard<'_, Flow>> {
        self.flow.try_lock()
    }

    pub fn use_cnt(&self) -> u32 {
        self.use_cnt.load(Ordering::Acquire)
    }

    pub fn incr_use_cnt(&self) {
        self.use_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decr_use_cnt(&self) {
        let prev = self.use_cnt.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Sets the ip-only scanned flag for `direction`, taking the lock.
    pub fn set_iponly_flag(&self, direction: PacketDirection) {
        let mut flow = self.flow.lock();
        flow.flags |= match direction {
            PacketDirection::ClientToServer => FlowFlags::TOSERVER_IPONLY_SET,
            PacketDirection::ServerToClient => FlowFlags::TOCLIENT_IPONLY_SET,
        };
    }

    pub fn set_no_packet_inspection(&self) {
        self.flow.lock().flags |= FlowFlags::NOPACKET_INSPECTION;
    }

    pub fn set_no_payload_inspection(&self) {
        self.flow.lock().flags |= FlowFlags::NOPAYLOAD_INSPECTION;
    }
}

/// Scoped retention of a flow beyond the call that returned it. Holding a
/// `FlowRef` keeps the flow out of reclamation; dropping it releases the
/// claim. Cloning extends the claim to another holder.
pub struct FlowRef(Arc<FlowNode>);

impl FlowRef {
    pub(crate) fn new(node: Arc<FlowNode>) -> Self {
        node.incr_use_cnt();
        FlowRef(node)
    }
}

impl Clone for FlowRef {
    fn clone(&self) -> Self {
        FlowRef::new(self.0.clone())
    }
}

impl Drop for FlowRef {
    fn drop(&mut self) {
        self.0.decr_use_cnt();
    }
}

impl Deref for FlowRef {
    type Target = FlowNode;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_key() -> LookupKey {
        LookupKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 1000,
            dst_port: 80,
            proto: IpProtocol::Tcp,
            ..Default::default()
        }
    }

    #[test]
    fn key_matches_both_orientations() {
        let pkt = tcp_key();
        let key = FlowKey::from_packet(&pkt);
        assert_eq!(key.matches(&pkt), Some(PacketDirection::ClientToServer));

        let mut reply = pkt.clone();
        std::mem::swap(&mut reply.src_ip, &mut reply.dst_ip);
        std::mem::swap(&mut reply.src_port, &mut reply.dst_port);
        assert_eq!(key.matches(&reply), Some(PacketDirection::ServerToClient));

        let mut other = pkt.clone();
        other.src_port = 1001;
        assert_eq!(key.matches(&other), None);

        let mut other_vlan = pkt;
        other_vlan.vlan_0 = 7;
        assert_eq!(key.matches(&other_vlan), None);
    }

    #[test]
    fn direction_by_port_then_address() {
        let pkt = tcp_key();
        let mut flow = Flow::default();
        flow.init(FlowKey::from_packet(&pkt), false);
        assert_eq!(
            flow.packet_direction(&pkt),
            PacketDirection::ClientToServer
        );

        let mut reply = pkt.clone();
        std::mem::swap(&mut reply.src_ip, &mut reply.dst_ip);
        std::mem::swap(&mut reply.src_port, &mut reply.dst_port);
        assert_eq!(
            flow.packet_direction(&reply),
            PacketDirection::ServerToClient
        );

        // equal ports fall back to address comparison
        let mut equal_ports = pkt.clone();
        equal_ports.src_port = 53;
        equal_ports.dst_port = 53;
        let mut flow = Flow::default();
        flow.init(FlowKey::from_packet(&equal_ports), false);
        assert_eq!(
            flow.packet_direction(&equal_ports),
            PacketDirection::ClientToServer
        );
        std::mem::swap(&mut equal_ports.src_ip, &mut equal_ports.dst_ip);
        assert_eq!(
            flow.packet_direction(&equal_ports),
            PacketDirection::ServerToClient
        );
    }

    #[test]
    fn state_heuristic_and_callback() {
        let mut flow = Flow::default();
        assert_eq!(flow.state(None), FlowState::New);
        flow.flags |= FlowFlags::TO_DST_SEEN;
        assert_eq!(flow.state(None), FlowState::New);
        flow.flags |= FlowFlags::TO_SRC_SEEN;
        assert_eq!(flow.state(None), FlowState::Established);

        fn always_closed(_: &(dyn std::any::Any + Send)) -> FlowState {
            FlowState::Closed
        }
        // callback only applies once a protocol context exists
        assert_eq!(flow.state(Some(always_closed)), FlowState::Established);
        flow.protoctx = Some(Box::new(0u32));
        assert_eq!(flow.state(Some(always_closed)), FlowState::Closed);
    }

    #[test]
    fn clear_runs_free_fn_and_is_idempotent() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static FREED: AtomicUsize = AtomicUsize::new(0);
        fn free(_: ProtoCtx) {
            FREED.fetch_add(1, Ordering::Relaxed);
        }

        let mut flow = Flow::default();
        flow.init(FlowKey::from_packet(&tcp_key()), true);
        assert!(flow.flags.contains(FlowFlags::EMERGENCY));
        flow.protoctx = Some(Box::new(1u8));

        flow.clear(Some(free));
        assert_eq!(FREED.load(Ordering::Relaxed), 1);
        assert_eq!(flow.flags, FlowFlags::empty());
        assert_eq!(flow.key, FlowKey::default());

        flow.clear(Some(free));
        assert_eq!(FREED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn flow_ref_tracks_use_cnt() {
        let node = Arc::new(FlowNode::new());
        assert_eq!(node.use_cnt(), 0);
        let r1 = FlowRef::new(node.clone());
        assert_eq!(node.use_cnt(), 1);
        let r2 = r1.clone();
        assert_eq!(node.use_cnt(), 2);
        drop(r1);
        drop(r2);
        assert_eq!(node.use_cnt(), 0);
    }
}
