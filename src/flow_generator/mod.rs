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

mod error;
mod flow_config;
pub mod flow_map;
mod flow_manager;
mod pool;

pub use error::{Error, Result};
pub use flow_config::{
    FlowConfig, FlowProto, FlowProtoEntry, FlowProtoTable, FLOW_DEFAULT_HASHSIZE,
    FLOW_DEFAULT_MEMCAP, FLOW_DEFAULT_PREALLOC,
};
pub use flow_map::{FlowMap, FlowMapCounter};
pub use flow_manager::FlowManager;
