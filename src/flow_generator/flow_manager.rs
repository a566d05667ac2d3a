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

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info};

use super::flow_map::FlowMap;

const CHECK_INTERVAL: Duration = Duration::from_secs(1);
// drain pressure faster while the cap is breached
const EMERGENCY_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// The reclaimer. One dedicated thread walking the hash for timed out
/// flows and keeping the spare queue at target. Only ever try-locks
/// flows, so it cannot stall the packet workers.
pub struct FlowManager {
    map: Arc<FlowMap>,
    thread: Mutex<Option<JoinHandle<()>>>,
    running: Arc<(Mutex<bool>, Condvar)>,
}

impl FlowManager {
    pub fn new(map: Arc<FlowMap>) -> Self {
        Self {
            map,
            thread: Mutex::new(None),
            running: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn start(&self) {
        {
            let (started, _) = &*self.running;
            let mut started = started.lock().unwrap();
            if *started {
                return;
            }
            *started = true;
        }

        let map = self.map.clone();
        let running = self.running.clone();
        let thread = thread::spawn(move || {
            loop {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                let freed = map.prune(now);
                if freed > 0 {
                    debug!("flow manager released {} flows", freed);
                }
                map.update_spare_flows();

                let interval = if map.in_emergency() {
                    EMERGENCY_CHECK_INTERVAL
                } else {
                    CHECK_INTERVAL
                };

                let (running, timer) = &*running;
                let mut running = running.lock().unwrap();
                if !*running {
                    break;
                }
                running = timer.wait_timeout(running, interval).unwrap().0;
                if !*running {
                    break;
                }
            }
            info!("flow manager exited");
        });

        self.thread.lock().unwrap().replace(thread);
        info!("flow manager started");
    }

    pub fn stop(&self) {
        let (stopped, timer) = &*self.running;
        {
            let mut stopped = stopped.lock().unwrap();
            if !*stopped {
                return;
            }
            *stopped = false;
        }
        timer.notify_one();

        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::enums::IpProtocol;
    use crate::common::meta_packet::MetaPacket;
    use crate::config::Config;

    #[test]
    fn start_stop_is_idempotent() {
        let mut conf = Config::new();
        conf.set("flow.hash-size", "64", true);
        conf.set("flow.prealloc", "4", true);
        let map = Arc::new(FlowMap::new(&conf, true).unwrap());
        let manager = FlowManager::new(map.clone());

        manager.start();
        manager.start();

        let mut packet = MetaPacket::new(
            "10.0.0.1".parse().unwrap(),
            1000,
            "10.0.0.2".parse().unwrap(),
            80,
            IpProtocol::Tcp,
        );
        map.handle_packet(&mut packet);
        assert!(packet.flow().is_some());

        manager.stop();
        manager.stop();
    }
}
