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

use std::mem;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc,
};
use std::time::Duration;

use bytesize::ByteSize;
use log::{info, warn};
use parking_lot::Mutex;
use rand::Rng;

use super::error::{Error, Result};
use super::flow_config::{FlowConfig, FlowProto, FlowProtoTable};
use super::pool::FlowPool;
use crate::common::enums::IpProtocol;
use crate::common::flow::{
    FlowFlags, FlowKey, FlowNode, FlowRef, PacketDirection, PacketFlowFlags, ProtoFreeFn,
    ProtoStateFn,
};
use crate::common::meta_packet::MetaPacket;
use crate::config::Config;
use crate::utils::hasher::flow_hash;
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

const FLOW_EMERGENCY: u8 = 0x01;

/// One slot of the flow hash. The lock guards the chain; the tuple is
/// duplicated into each entry so scans never touch a flow lock.
#[derive(Default)]
struct FlowBucket {
    chain: Mutex<Vec<(FlowKey, Arc<FlowNode>)>>,
}

#[derive(Default)]
pub struct FlowMapCounter {
    new: AtomicU64,
    reused: AtomicU64,
    drop_by_memcap: AtomicU64,
    pruned: AtomicU64,
    concurrent: AtomicU64,
    in_emergency: AtomicU64,
}

impl RefCountable for FlowMapCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "new",
                CounterType::Counted,
                CounterValue::Unsigned(self.new.swap(0, Ordering::Relaxed)),
            ),
            (
                "reused",
                CounterType::Counted,
                CounterValue::Unsigned(self.reused.swap(0, Ordering::Relaxed)),
            ),
            (
                "drop_by_memcap",
                CounterType::Counted,
                CounterValue::Unsigned(self.drop_by_memcap.swap(0, Ordering::Relaxed)),
            ),
            (
                "pruned",
                CounterType::Counted,
                CounterValue::Unsigned(self.pruned.swap(0, Ordering::Relaxed)),
            ),
            (
                "concurrent",
                CounterType::Gauged,
                CounterValue::Unsigned(self.concurrent.load(Ordering::Relaxed)),
            ),
            (
                "in_emergency",
                CounterType::Gauged,
                CounterValue::Unsigned(self.in_emergency.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/// The flow hash table and lifecycle engine. Shared across packet worker
/// threads and the flow manager; all interior state is bucket-locked or
/// atomic. Registration methods take `&mut self` and belong to the single
/// threaded initialization phase, like configuration writes.
pub struct FlowMap {
    buckets: Option<Box<[FlowBucket]>>,
    hash_rand: u64,
    config: FlowConfig,
    protos: FlowProtoTable,
    spare: FlowPool,
    memuse: AtomicU64,
    flags: AtomicU8,
    // Reclamation resumes where the previous pass left off, otherwise
    // pressure concentrates on the low buckets.
    prune_idx: AtomicU32,
    counter: Arc<FlowMapCounter>,
}

impl FlowMap {
    pub fn new(conf: &Config, quiet: bool) -> Result<Self> {
        let config = FlowConfig::load(conf)?;
        let protos = FlowProtoTable::load(conf);

        let bucket_size = mem::size_of::<FlowBucket>() as u64;
        let hash_area = config.hash_size as u64 * bucket_size;
        if config.memcap < hash_area {
            return Err(Error::MemcapTooSmall {
                memcap: config.memcap,
                hash_area,
            });
        }

        let buckets = (0..config.hash_size)
            .map(|_| FlowBucket::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let map = FlowMap {
            buckets: Some(buckets),
            hash_rand: rand::thread_rng().gen(),
            spare: FlowPool::new(config.prealloc),
            memuse: AtomicU64::new(hash_area),
            flags: AtomicU8::new(0),
            prune_idx: AtomicU32::new(0),
            counter: Arc::new(FlowMapCounter::default()),
            config,
            protos,
        };

        if !quiet {
            info!(
                "allocated {} of memory for the flow hash, {} buckets of size {}",
                ByteSize::b(hash_area).to_string_as(true),
                map.config.hash_size,
                bucket_size
            );
        }

        for _ in 0..map.config.prealloc {
            if !map.would_fit(Self::flow_node_size()) {
                return Err(Error::PreallocExceedsMemcap {
                    memcap: map.config.memcap,
                    memuse: map.memuse.load(Ordering::Relaxed),
                });
            }
            let node = map.alloc_flow();
            if map.spare.put(node).is_some() {
                break;
            }
        }

        if !quiet {
            info!(
                "preallocated {} flows of size {}",
                map.spare.len(),
                Self::flow_node_size()
            );
            info!(
                "flow memory usage: {}, maximum: {}",
                ByteSize::b(map.memuse.load(Ordering::Relaxed)).to_string_as(true),
                ByteSize::b(map.config.memcap).to_string_as(true)
            );
        }

        Ok(map)
    }

    fn flow_node_size() -> u64 {
        mem::size_of::<FlowNode>() as u64
    }

    pub fn memuse(&self) -> u64 {
        self.memuse.load(Ordering::Relaxed)
    }

    pub fn spare_len(&self) -> usize {
        self.spare.len()
    }

    pub fn live_flows(&self) -> u64 {
        self.counter.concurrent.load(Ordering::Relaxed)
    }

    pub fn counter(&self) -> &Arc<FlowMapCounter> {
        &self.counter
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn in_emergency(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLOW_EMERGENCY != 0
    }

    fn set_emergency(&self) {
        if self.flags.fetch_or(FLOW_EMERGENCY, Ordering::AcqRel) & FLOW_EMERGENCY == 0 {
            self.counter.in_emergency.store(1, Ordering::Relaxed);
            warn!(
                "flow memcap reached (memcap {}), entering emergency mode",
                self.config.memcap
            );
        }
    }

    fn clear_emergency(&self) {
        if self.flags.fetch_and(!FLOW_EMERGENCY, Ordering::AcqRel) & FLOW_EMERGENCY != 0 {
            self.counter.in_emergency.store(0, Ordering::Relaxed);
            info!("flow memory usage recovered, leaving emergency mode");
        }
    }

    fn would_fit(&self, size: u64) -> bool {
        self.memuse.load(Ordering::Relaxed) + size <= self.config.memcap
    }

    fn alloc_flow(&self) -> Arc<FlowNode> {
        self.memuse
            .fetch_add(Self::flow_node_size(), Ordering::Relaxed);
        Arc::new(FlowNode::new())
    }

    fn free_flow(&self, node: Arc<FlowNode>) {
        drop(node);
        self.memuse
            .fetch_sub(Self::flow_node_size(), Ordering::Relaxed);
    }

    // Spare queue first, fresh allocation while the cap allows it.
    fn acquire_flow(&self) -> Option<Arc<FlowNode>> {
        if let Some(node) = self.spare.get() {
            return Some(node);
        }
        if self.would_fit(Self::flow_node_size()) {
            Some(self.alloc_flow())
        } else {
            None
        }
    }

    // Clears the flow record and returns the node to the spare queue,
    // freeing it when the queue is at target.
    fn release_flow(&self, node: Arc<FlowNode>) {
        {
            let mut flow = node.lock();
            let proto_map = FlowProto::from(flow.key.proto);
            flow.clear(self.protos.entry(proto_map).free);
        }
        if let Some(overflow) = self.spare.put(node) {
            self.free_flow(overflow);
        }
    }

    fn bucket_index(&self, packet: &MetaPacket) -> usize {
        let hash = flow_hash(&packet.lookup_key, self.hash_rand);
        (hash % self.config.hash_size as u64) as usize
    }

    /// The per packet get-or-create path. Returns the flow with the
    /// packet's retention claim already taken, or None when the memory cap
    /// forbids creating one (which also trips emergency mode).
    pub fn get_or_create(&self, packet: &MetaPacket) -> Option<FlowRef> {
        let buckets = self.buckets.as_ref()?;
        let bucket = &buckets[self.bucket_index(packet)];

        {
            let chain = bucket.chain.lock();
            for (key, node) in chain.iter() {
                if key.matches(&packet.lookup_key).is_some() {
                    self.counter.reused.fetch_add(1, Ordering::Relaxed);
                    return Some(FlowRef::new(node.clone()));
                }
            }
        }

        // allocate with the bucket unlocked
        let Some(node) = self.acquire_flow() else {
            self.set_emergency();
            self.counter.drop_by_memcap.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let mut chain = bucket.chain.lock();
        // the chain may have gained the tuple while the lock was dropped
        for (key, existing) in chain.iter() {
            if key.matches(&packet.lookup_key).is_some() {
                let flow_ref = FlowRef::new(existing.clone());
                drop(chain);
                self.counter.reused.fetch_add(1, Ordering::Relaxed);
                self.release_flow(node);
                return Some(flow_ref);
            }
        }

        let key = FlowKey::from_packet(&packet.lookup_key);
        {
            let mut flow = node.lock();
            flow.init(key.clone(), self.in_emergency());
        }
        let flow_ref = FlowRef::new(node.clone());
        chain.insert(0, (key, node));
        self.counter.new.fetch_add(1, Ordering::Relaxed);
        self.counter.concurrent.fetch_add(1, Ordering::Relaxed);
        Some(flow_ref)
    }

    /// Entry point for packet flow handling, called for every packet.
    /// Attaches the flow and the direction / established / inspection
    /// bits; a packet without a flow afterwards is out of flow memory.
    pub fn handle_packet(&self, packet: &mut MetaPacket) {
        let Some(flow_ref) = self.get_or_create(packet) else {
            return;
        };

        {
            let mut flow = flow_ref.lock();
            flow.lastts = Duration::from_secs(packet.lookup_key.timestamp.as_secs());

            match flow.packet_direction(&packet.lookup_key) {
                PacketDirection::ClientToServer => {
                    if update_seen_flag(packet) {
                        flow.flags |= FlowFlags::TO_DST_SEEN;
                    }
                    packet.flow_flags |= PacketFlowFlags::TO_SERVER;
                }
                PacketDirection::ServerToClient => {
                    if update_seen_flag(packet) {
                        flow.flags |= FlowFlags::TO_SRC_SEEN;
                    }
                    packet.flow_flags |= PacketFlowFlags::TO_CLIENT;
                }
            }

            if flow
                .flags
                .contains(FlowFlags::TO_DST_SEEN | FlowFlags::TO_SRC_SEEN)
            {
                packet.flow_flags |= PacketFlowFlags::ESTABLISHED;
            }

            if flow.flags.contains(FlowFlags::NOPACKET_INSPECTION) {
                packet.flow_flags |= PacketFlowFlags::NOPACKET_INSPECTION;
            }
            if flow.flags.contains(FlowFlags::NOPAYLOAD_INSPECTION) {
                packet.flow_flags |= PacketFlowFlags::NOPAYLOAD_INSPECTION;
            }
        }

        packet.flow_flags |= PacketFlowFlags::HAS_FLOW;
        packet.flow = Some(flow_ref);
    }

    /// Walks the hash circularly from where the previous pass stopped,
    /// expiring flows whose effective timeout has passed. Returns the
    /// number of flows released. Never blocks on a flow lock.
    pub fn prune(&self, now: Duration) -> u32 {
        let Some(buckets) = self.buckets.as_ref() else {
            return 0;
        };
        let emergency = self.in_emergency();
        let hash_size = buckets.len();
        let budget = self.config.flow_try_release;
        let mut freed = 0u32;
        let mut idx = self.prune_idx.load(Ordering::Relaxed) as usize % hash_size;

        for _ in 0..hash_size {
            if freed >= budget {
                break;
            }
            let mut chain = buckets[idx].chain.lock();
            let mut i = 0;
            while i < chain.len() && freed < budget {
                let node = &chain[i].1;
                if node.use_cnt() > 0 {
                    i += 1;
                    continue;
                }
                // a worker between the bucket unlock and the flow lock
                // holds a use count, so a locked flow here is transient
                let expired = match node.try_lock() {
                    Some(flow) => {
                        let proto_map = FlowProto::from(flow.key.proto);
                        let state = flow.state(self.protos.entry(proto_map).get_state);
                        let timeout = self.protos.timeout(proto_map, state, emergency);
                        now.saturating_sub(flow.lastts).as_secs() >= timeout as u64
                    }
                    None => false,
                };
                if !expired {
                    i += 1;
                    continue;
                }
                let (_, node) = chain.remove(i);
                self.release_flow(node);
                self.counter.concurrent.fetch_sub(1, Ordering::Relaxed);
                self.counter.pruned.fetch_add(1, Ordering::Relaxed);
                freed += 1;
            }
            drop(chain);
            idx = (idx + 1) % hash_size;
        }
        self.prune_idx.store(idx as u32, Ordering::Relaxed);

        if emergency {
            let threshold =
                self.config.memcap * (100 - self.config.emergency_recovery as u64) / 100;
            if self.memuse.load(Ordering::Relaxed) < threshold {
                self.clear_emergency();
            }
        }
        freed
    }

    /// Drives the spare queue length toward the prealloc target. Returns
    /// false when the memory cap cut the refill short.
    pub fn update_spare_flows(&self) -> bool {
        let len = self.spare.len() as u32;
        let target = self.config.prealloc;
        if len < target {
            for _ in 0..target - len {
                if !self.would_fit(Self::flow_node_size()) {
                    return false;
                }
                let node = self.alloc_flow();
                if let Some(overflow) = self.spare.put(node) {
                    // raced with a concurrent release, queue is full
                    self.free_flow(overflow);
                    break;
                }
            }
        } else if len > target {
            for _ in 0..len - target {
                match self.spare.get() {
                    Some(node) => self.free_flow(node),
                    None => break,
                }
            }
        }
        true
    }

    /// Releases every flow and the hash itself. Workers must have stopped;
    /// afterwards `memuse()` is zero and the engine accepts no packets.
    pub fn shutdown(&mut self) {
        while let Some(node) = self.spare.get() {
            self.free_flow(node);
        }

        if let Some(buckets) = self.buckets.take() {
            for bucket in buckets.iter() {
                let mut chain = bucket.chain.lock();
                for (_, node) in chain.drain(..) {
                    {
                        let mut flow = node.lock();
                        let proto_map = FlowProto::from(flow.key.proto);
                        flow.clear(self.protos.entry(proto_map).free);
                    }
                    self.free_flow(node);
                    self.counter.concurrent.fetch_sub(1, Ordering::Relaxed);
                }
            }
            let bucket_size = mem::size_of::<FlowBucket>() as u64;
            self.memuse
                .fetch_sub(buckets.len() as u64 * bucket_size, Ordering::Relaxed);
        }
    }

    pub fn set_proto_timeout(&mut self, proto: IpProtocol, new: u32, est: u32, closed: u32) {
        self.protos.set_proto_timeout(proto, new, est, closed);
    }

    pub fn set_proto_emergency_timeout(
        &mut self,
        proto: IpProtocol,
        new: u32,
        est: u32,
        closed: u32,
    ) {
        self.protos
            .set_proto_emergency_timeout(proto, new, est, closed);
    }

    pub fn set_proto_free_func(&mut self, proto: IpProtocol, free: ProtoFreeFn) {
        self.protos.set_proto_free_func(proto, free);
    }

    pub fn set_flow_state_func(&mut self, proto: IpProtocol, get_state: ProtoStateFn) {
        self.protos.set_flow_state_func(proto, get_state);
    }
}

// ICMPv4 error messages carry someone else's conversation and do not
// count as traffic seen in their own direction.
fn update_seen_flag(packet: &MetaPacket) -> bool {
    !packet.is_icmpv4_error()
}
