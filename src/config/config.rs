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

use std::collections::HashMap;

use log::debug;

/// One configuration entry: a scalar value, a subtree of child nodes, or
/// both. `allow_override` decides whether a later set may replace it.
#[derive(Debug, Clone, Default)]
pub struct ConfNode {
    pub name: String,
    pub val: Option<String>,
    pub allow_override: bool,
    children: Vec<ConfNode>,
}

impl ConfNode {
    pub fn new<S: Into<String>>(name: S) -> Self {
        ConfNode {
            name: name.into(),
            val: None,
            allow_override: true,
            children: vec![],
        }
    }

    pub fn with_value<S: Into<String>, V: Into<String>>(name: S, val: V) -> Self {
        ConfNode {
            name: name.into(),
            val: Some(val.into()),
            allow_override: true,
            children: vec![],
        }
    }

    pub fn add_child(&mut self, child: ConfNode) {
        self.children.push(child);
    }

    pub fn children(&self) -> &[ConfNode] {
        &self.children
    }

    pub fn lookup_child(&self, name: &str) -> Option<&ConfNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn lookup_child_value(&self, name: &str) -> Option<&str> {
        self.lookup_child(name).and_then(|c| c.val.as_deref())
    }
}

/// Key/value configuration store. Values are only written during engine
/// initialization on a single thread; steady-state readers take `&Config`
/// without any locking.
#[derive(Debug, Default)]
pub struct Config {
    nodes: HashMap<String, ConfNode>,
}

impl Config {
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets a scalar parameter. Returns false without touching the store
    /// when the existing node forbids overriding.
    pub fn set(&mut self, name: &str, val: &str, allow_override: bool) -> bool {
        if let Some(existing) = self.nodes.get(name) {
            if !existing.allow_override {
                return false;
            }
        }
        let mut node = ConfNode::with_value(name, val);
        node.allow_override = allow_override;
        self.nodes.insert(name.to_owned(), node);
        debug!("configuration parameter '{}' set", name);
        true
    }

    /// Inserts or replaces a whole subtree keyed by `node.name`.
    pub fn set_node(&mut self, node: ConfNode) -> bool {
        if let Some(existing) = self.nodes.get(&node.name) {
            if !existing.allow_override {
                return false;
            }
        }
        self.nodes.insert(node.name.clone(), node);
        true
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        match self.nodes.get(name) {
            Some(node) => node.val.as_deref(),
            None => {
                debug!("failed to lookup configuration parameter '{}'", name);
                None
            }
        }
    }

    pub fn get_node(&self, name: &str) -> Option<&ConfNode> {
        self.nodes.get(name)
    }

    /// Integer accessor with C-style base auto-detection: `0x` prefix is
    /// hex, a leading `0` is octal, everything else decimal. Trailing
    /// non-digits or an out-of-range value fail the lookup.
    pub fn get_int(&self, name: &str) -> Option<i64> {
        parse_int(self.get(name)?)
    }

    /// Boolean accessor. The true set is {"1", "yes", "true", "on"}, case
    /// insensitive; any other present value reads as false.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        let val = self.get(name)?;
        Some(
            ["1", "yes", "true", "on"]
                .iter()
                .any(|t| val.eq_ignore_ascii_case(t)),
        )
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.nodes.remove(name).is_some()
    }

    /// Diagnostic traversal of the whole store.
    pub fn dump(&self) {
        for node in self.nodes.values() {
            dump_node(node, "");
        }
    }
}

fn dump_node(node: &ConfNode, prefix: &str) {
    let name = if prefix.is_empty() {
        node.name.clone()
    } else {
        format!("{}.{}", prefix, node.name)
    };
    match &node.val {
        Some(val) => println!("{} = {}", name, val),
        None => println!("{}", name),
    }
    for child in node.children() {
        dump_node(child, &name);
    }
}

fn parse_int(s: &str) -> Option<i64> {
    // strtoimax semantics: leading whitespace skipped, the whole rest of
    // the string must be consumed
    let s = s.trim_start();
    let (neg, rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, digits) = if let Some(r) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        (16, r)
    } else if rest.len() > 1 && rest.starts_with('0') {
        (8, &rest[1..])
    } else {
        (10, rest)
    };
    if digits.is_empty() {
        return None;
    }
    let val = i128::from_str_radix(digits, radix).ok()?;
    i64::try_from(if neg { -val } else { val }).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_non_existent() {
        let conf = Config::new();
        assert_eq!(conf.get("non-existent-value"), None);
    }

    #[test]
    fn set_and_get() {
        let mut conf = Config::new();
        assert!(conf.set("some-name", "some-value", true));
        assert_eq!(conf.get("some-name"), Some("some-value"));
        assert!(conf.remove("some-name"));
        assert!(!conf.remove("some-name"));
    }

    #[test]
    fn override_allowed() {
        let mut conf = Config::new();
        assert!(conf.set("some-name", "some-value", true));
        assert!(conf.set("some-name", "new-value", true));
        assert_eq!(conf.get("some-name"), Some("new-value"));
    }

    #[test]
    fn override_refused() {
        let mut conf = Config::new();
        assert!(conf.set("some-name", "some-value", false));
        assert!(!conf.set("some-name", "new-value", true));
        assert_eq!(conf.get("some-name"), Some("some-value"));
    }

    #[test]
    fn node_tree() {
        let mut conf = Config::new();
        let mut timeouts = ConfNode::new("flow-timeouts");
        let mut tcp = ConfNode::new("tcp");
        tcp.add_child(ConfNode::with_value("new", "10"));
        tcp.add_child(ConfNode::with_value("established", "100"));
        timeouts.add_child(tcp);
        assert!(conf.set_node(timeouts));

        let node = conf.get_node("flow-timeouts").unwrap();
        let tcp = node.lookup_child("tcp").unwrap();
        assert_eq!(tcp.lookup_child_value("new"), Some("10"));
        assert_eq!(tcp.lookup_child_value("closed"), None);
        assert!(node.lookup_child("udp").is_none());

        assert!(conf.remove("flow-timeouts"));
        assert!(conf.get_node("flow-timeouts").is_none());
    }

    #[test]
    fn get_int_bases_and_garbage() {
        let mut conf = Config::new();
        conf.set("some-int", "0", true);
        assert_eq!(conf.get_int("some-int"), Some(0));
        conf.set("some-int", "-1", true);
        assert_eq!(conf.get_int("some-int"), Some(-1));
        conf.set("some-int", "0xffff", true);
        assert_eq!(conf.get_int("some-int"), Some(0xffff));
        conf.set("some-int", "0644", true);
        assert_eq!(conf.get_int("some-int"), Some(0o644));
        conf.set("some-int", "not-an-int", true);
        assert_eq!(conf.get_int("some-int"), None);
        conf.set("some-int", "123abc", true);
        assert_eq!(conf.get_int("some-int"), None);
        conf.set("some-int", "99999999999999999999999", true);
        assert_eq!(conf.get_int("some-int"), None);
    }

    #[test]
    fn get_bool_true_set() {
        let mut conf = Config::new();
        for v in ["1", "on", "ON", "yes", "YeS", "true", "TRUE"] {
            conf.set("some-bool", v, true);
            assert_eq!(conf.get_bool("some-bool"), Some(true), "{}", v);
        }
        for v in ["0", "something", "off", "false", "no", "maybe"] {
            conf.set("some-bool", v, true);
            assert_eq!(conf.get_bool("some-bool"), Some(false), "{}", v);
        }
        assert_eq!(conf.get_bool("missing-bool"), None);
    }
}
