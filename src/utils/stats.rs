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

use std::fmt::Write;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::info;

const TICK_CYCLE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
pub enum CounterType {
    Counted,
    Gauged,
}

#[derive(Clone, Copy, Debug)]
pub enum CounterValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

pub type Counter = (&'static str, CounterType, CounterValue);

pub trait RefCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
}

pub trait OwnedCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
    fn closed(&self) -> bool;
}

pub enum Countable {
    Owned(Box<dyn OwnedCountable>),
    Ref(Weak<dyn RefCountable>),
}

impl Countable {
    fn get_counters(&self) -> Vec<Counter> {
        match self {
            Countable::Owned(c) => c.get_counters(),
            Countable::Ref(c) => c.upgrade().map(|c| c.get_counters()).unwrap_or_default(),
        }
    }

    fn closed(&self) -> bool {
        match self {
            Countable::Owned(c) => c.closed(),
            Countable::Ref(c) => c.strong_count() == 0,
        }
    }
}

struct Source {
    module: &'static str,
    countable: Countable,
}

/// Drains registered counter sources on a fixed tick. The sink is the log;
/// an exporting backend can be layered on the `Countable` boundary.
pub struct Collector {
    sources: Arc<Mutex<Vec<Source>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    running: Arc<(Mutex<bool>, Condvar)>,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            sources: Arc::new(Mutex::new(vec![])),
            thread: Mutex::new(None),
            running: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn register_countable(&self, module: &'static str, countable: Countable) {
        self.sources.lock().unwrap().push(Source { module, countable });
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

        let sources = self.sources.clone();
        let running = self.running.clone();
        let thread = thread::spawn(move || {
            loop {
                {
                    let mut sources = sources.lock().unwrap();
                    sources.retain(|s| !s.countable.closed());
                    for source in sources.iter() {
                        let counters = source.countable.get_counters();
                        if counters.is_empty() {
                            continue;
                        }
                        let mut line = String::new();
                        for (name, _, value) in counters {
                            let _ = match value {
                                CounterValue::Signed(v) => write!(line, " {}={}", name, v),
                                CounterValue::Unsigned(v) => write!(line, " {}={}", name, v),
                                CounterValue::Float(v) => write!(line, " {}={}", name, v),
                            };
                        }
                        info!("stats {}:{}", source.module, line);
                    }
                }

                let (running, timer) = &*running;
                let mut running = running.lock().unwrap();
                if !*running {
                    break;
                }
                running = timer.wait_timeout(running, TICK_CYCLE).unwrap().0;
                if !*running {
                    break;
                }
            }
            info!("stats collector exited");
        });

        self.thread.lock().unwrap().replace(thread);
        info!("stats collector started");
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

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct TestCounter(AtomicU64);

    impl RefCountable for TestCounter {
        fn get_counters(&self) -> Vec<Counter> {
            vec![(
                "ticks",
                CounterType::Counted,
                CounterValue::Unsigned(self.0.swap(0, Ordering::Relaxed)),
            )]
        }
    }

    #[test]
    fn dropped_source_is_retired() {
        let collector = Collector::new();
        let counter = Arc::new(TestCounter::default());
        collector.register_countable(
            "test",
            Countable::Ref(Arc::downgrade(&counter) as Weak<dyn RefCountable>),
        );
        {
            let sources = collector.sources.lock().unwrap();
            assert!(!sources[0].countable.closed());
            assert_eq!(sources[0].countable.get_counters().len(), 1);
        }
        drop(counter);
        let sources = collector.sources.lock().unwrap();
        assert!(sources[0].countable.closed());
        assert!(sources[0].countable.get_counters().is_empty());
    }
}
