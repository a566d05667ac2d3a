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

use std::net::IpAddr;

use crate::common::lookup_key::LookupKey;

// Jenkins Wiki: https://en.wikipedia.org/wiki/Jenkins_hash_function
//
// Not cryptographic. The per-process seed mixed in by the caller is what
// defeats adversarial bucket collisions.
fn jenkins64(mut hash: u64) -> u64 {
    hash = hash
        .overflowing_shl(21)
        .0
        .overflowing_sub(hash)
        .0
        .overflowing_sub(1)
        .0;
    hash = hash ^ hash.overflowing_shr(24).0;
    hash = hash
        .overflowing_add(hash.overflowing_shl(3).0)
        .0
        .overflowing_add(hash.overflowing_shl(8).0)
        .0;
    hash = hash ^ hash.overflowing_shr(14).0;
    hash = hash
        .overflowing_add(hash.overflowing_shl(2).0)
        .0
        .overflowing_add(hash.overflowing_shl(4).0)
        .0;
    hash = hash ^ hash.overflowing_shr(28).0;
    hash = hash.overflowing_add(hash.overflowing_shl(31).0).0;

    hash
}

// Folds the two addresses into one word ordered by magnitude, so a packet
// and its reply produce the same value.
fn l3_hash(key: &LookupKey) -> u64 {
    let (src, dst) = match (key.src_ip, key.dst_ip) {
        (IpAddr::V4(s), IpAddr::V4(d)) => (u32::from_le_bytes(s.octets()), u32::from_le_bytes(d.octets())),
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let (src, dst) = (s.octets(), d.octets());
            src.chunks(4)
                .zip(dst.chunks(4))
                .fold((0, 0), |(hash1, hash2), (b1, b2)| {
                    (
                        hash1 ^ u32::from_le_bytes(*<&[u8; 4]>::try_from(b1).unwrap()),
                        hash2 ^ u32::from_le_bytes(*<&[u8; 4]>::try_from(b2).unwrap()),
                    )
                })
        }
        // mixed families never share a flow, bucket placement is arbitrary
        (_, _) => (0, 0),
    };

    if src >= dst {
        (src as u64) << 32 | dst as u64
    } else {
        (dst as u64) << 32 | src as u64
    }
}

fn l4_hash(key: &LookupKey) -> u64 {
    if key.src_port >= key.dst_port {
        (key.src_port as u64) << 16 | key.dst_port as u64
    } else {
        (key.dst_port as u64) << 16 | key.src_port as u64
    }
}

/// Bucket hash of a packet tuple, commutative over the (src, dst) and
/// (sp, dp) pairs so that both directions of a conversation land in the
/// same bucket. `seed` is the per-process randomization.
pub fn flow_hash(key: &LookupKey, seed: u64) -> u64 {
    let proto_vlan =
        (u8::from(key.proto) as u64) << 32 | (key.vlan_0 as u64) << 16 | key.vlan_1 as u64;
    jenkins64(seed) ^ jenkins64(l3_hash(key)) ^ jenkins64(l4_hash(key)) ^ jenkins64(proto_vlan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::enums::IpProtocol;

    fn key(src: &str, sp: u16, dst: &str, dp: u16) -> LookupKey {
        LookupKey {
            src_ip: src.parse().unwrap(),
            dst_ip: dst.parse().unwrap(),
            src_port: sp,
            dst_port: dp,
            proto: IpProtocol::Tcp,
            ..Default::default()
        }
    }

    #[test]
    fn hash_is_commutative() {
        let forward = key("192.168.66.1", 19001, "192.168.66.2", 19002);
        let reverse = key("192.168.66.2", 19002, "192.168.66.1", 19001);
        assert_eq!(flow_hash(&forward, 0x1234), flow_hash(&reverse, 0x1234));

        let forward6 = LookupKey {
            src_ip: "fe80::88d3:f197:5843:f873".parse().unwrap(),
            dst_ip: "fe80::742a:d20d:8d45:56e6".parse().unwrap(),
            src_port: 443,
            dst_port: 50000,
            proto: IpProtocol::Tcp,
            ..Default::default()
        };
        let mut reverse6 = forward6.clone();
        std::mem::swap(&mut reverse6.src_ip, &mut reverse6.dst_ip);
        std::mem::swap(&mut reverse6.src_port, &mut reverse6.dst_port);
        assert_eq!(flow_hash(&forward6, 99), flow_hash(&reverse6, 99));
    }

    #[test]
    fn seed_changes_hash() {
        let k = key("10.0.0.1", 1000, "10.0.0.2", 80);
        assert_ne!(flow_hash(&k, 1), flow_hash(&k, 2));
    }

    #[test]
    fn tuple_fields_change_hash() {
        let base = key("10.0.0.1", 1000, "10.0.0.2", 80);
        let mut other_port = base.clone();
        other_port.src_port = 1001;
        assert_ne!(flow_hash(&base, 7), flow_hash(&other_port, 7));

        let mut other_vlan = base.clone();
        other_vlan.vlan_0 = 100;
        assert_ne!(flow_hash(&base, 7), flow_hash(&other_vlan, 7));

        let mut other_proto = base;
        other_proto.proto = IpProtocol::Udp;
        assert_ne!(flow_hash(&other_proto, 7), flow_hash(&other_vlan, 7));
    }
}
