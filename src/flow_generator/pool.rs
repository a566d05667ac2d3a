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

use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::flow::FlowNode;

/// Spare queue: cleared flow records ready for immediate reuse. `target`
/// is the configured prealloc count the queue is driven toward.
pub(super) struct FlowPool {
    target: u32,
    objs: Mutex<Vec<Arc<FlowNode>>>,
}

impl FlowPool {
    pub fn new(target: u32) -> Self {
        FlowPool {
            target,
            objs: Mutex::new(Vec::with_capacity(target as usize)),
        }
    }

    pub fn get(&self) -> Option<Arc<FlowNode>> {
        self.objs.lock().pop()
    }

    /// Stores a cleared flow. Above the target length the flow is handed
    /// back so the caller can free it and settle the memory accounting.
    pub fn put(&self, node: Arc<FlowNode>) -> Option<Arc<FlowNode>> {
        let mut objs = self.objs.lock();
        if objs.len() >= self.target as usize {
            return Some(node);
        }
        objs.push(node);
        None
    }

    pub fn len(&self) -> usize {
        self.objs.lock().len()
    }
}
