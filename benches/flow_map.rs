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

use std::time::{Duration, Instant};

use criterion::*;

use flow_engine::{
    common::{enums::IpProtocol, meta_packet::MetaPacket},
    config::Config,
    flow_generator::FlowMap,
};

fn packet(src_port: u16, ts: u64) -> MetaPacket {
    MetaPacket::new(
        "10.0.0.1".parse().unwrap(),
        src_port,
        "10.0.0.2".parse().unwrap(),
        80,
        IpProtocol::Tcp,
    )
    .with_timestamp(Duration::from_secs(ts))
}

fn new_map() -> FlowMap {
    let mut conf = Config::new();
    conf.set("flow.memcap", "128mb", true);
    FlowMap::new(&conf, true).unwrap()
}

fn bench_flow_map(c: &mut Criterion) {
    c.bench_function("handle_packet_hit", |b| {
        b.iter_custom(|iters| {
            let map = new_map();
            let start = Instant::now();
            for i in 0..iters {
                let mut p = packet(1000, i);
                map.handle_packet(&mut p);
            }
            start.elapsed()
        })
    });
    c.bench_function("handle_packet_miss", |b| {
        b.iter_custom(|iters| {
            let map = new_map();
            let start = Instant::now();
            for i in 0..iters {
                let mut p = packet((i % 60000) as u16 + 1, 1);
                map.handle_packet(&mut p);
            }
            start.elapsed()
        })
    });
    c.bench_function("prune_idle", |b| {
        b.iter_custom(|iters| {
            let map = new_map();
            for i in 0..4096u16 {
                let mut p = packet(i + 1, 1);
                map.handle_packet(&mut p);
            }
            let start = Instant::now();
            for _ in 0..iters {
                // nothing aged out, measures the walk itself
                map.prune(Duration::from_secs(2));
            }
            start.elapsed()
        })
    });
}

criterion_group!(benches, bench_flow_map);
criterion_main!(benches);
