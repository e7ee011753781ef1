//! Node state record and the per-cycle state diff.
//!
//! `NodeState` has a fixed schema: every field is named, and constructing one
//! from loose key/value pairs rejects keys outside that schema. A `StateDiff`
//! is computed from two snapshots taken at the start and end of a cycle.

use crate::error::{FpndError, FpndResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One of the two managed tunnel interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Iface {
    /// Entry/exit interface `fpn0`.
    Fpn0,
    /// Second interface `fpn1`.
    Fpn1,
}

impl Iface {
    /// Both managed interfaces, in order.
    pub const ALL: [Iface; 2] = [Iface::Fpn0, Iface::Fpn1];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fpn0 => "fpn0",
            Self::Fpn1 => "fpn1",
        }
    }

    /// The state key holding this interface's up/down flag.
    pub fn flag_key(&self) -> StateKey {
        match self {
            Self::Fpn0 => StateKey::Fpn0,
            Self::Fpn1 => StateKey::Fpn1,
        }
    }

    /// The state key holding this interface's network id.
    pub fn network_key(&self) -> StateKey {
        match self {
            Self::Fpn0 => StateKey::FpnId0,
            Self::Fpn1 => StateKey::FpnId1,
        }
    }

    /// Map a device name reported by the overlay daemon to a managed interface.
    pub fn from_device(name: &str) -> Option<Self> {
        match name {
            "fpn0" => Some(Self::Fpn0),
            "fpn1" => Some(Self::Fpn1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Iface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named fields of [`NodeState`], in diff order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKey {
    #[serde(rename = "fpn_id")]
    FpnId,
    #[serde(rename = "fpn0")]
    Fpn0,
    #[serde(rename = "fpn1")]
    Fpn1,
    #[serde(rename = "fpn_id0")]
    FpnId0,
    #[serde(rename = "fpn_id1")]
    FpnId1,
    #[serde(rename = "moon_id0")]
    MoonId0,
    #[serde(rename = "moon_addr")]
    MoonAddr,
    #[serde(rename = "cfg_ref")]
    CfgRef,
    #[serde(rename = "wdg_ref")]
    WdgRef,
    #[serde(rename = "route")]
    Route,
    #[serde(rename = "msg_ref")]
    MsgRef,
}

impl StateKey {
    pub const ALL: [StateKey; 11] = [
        StateKey::FpnId,
        StateKey::Fpn0,
        StateKey::Fpn1,
        StateKey::FpnId0,
        StateKey::FpnId1,
        StateKey::MoonId0,
        StateKey::MoonAddr,
        StateKey::CfgRef,
        StateKey::WdgRef,
        StateKey::Route,
        StateKey::MsgRef,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FpnId => "fpn_id",
            Self::Fpn0 => "fpn0",
            Self::Fpn1 => "fpn1",
            Self::FpnId0 => "fpn_id0",
            Self::FpnId1 => "fpn_id1",
            Self::MoonId0 => "moon_id0",
            Self::MoonAddr => "moon_addr",
            Self::CfgRef => "cfg_ref",
            Self::WdgRef => "wdg_ref",
            Self::Route => "route",
            Self::MsgRef => "msg_ref",
        }
    }

    /// The managed interface this key is the up/down flag of, if any.
    pub fn iface(&self) -> Option<Iface> {
        match self {
            Self::Fpn0 => Some(Iface::Fpn0),
            Self::Fpn1 => Some(Iface::Fpn1),
            _ => None,
        }
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StateKey {
    type Err = FpndError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StateKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| FpndError::UnknownStateKey(s.to_string()))
    }
}

/// Process-wide node state.
///
/// Invariant: an interface flag and its network id are set and cleared
/// together; use [`NodeState::set_interface`] and
/// [`NodeState::clear_interface`] rather than touching the fields directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeState {
    /// Overlay node identifier.
    pub fpn_id: Option<String>,
    pub fpn0: bool,
    pub fpn1: bool,
    /// Network id bound to `fpn0`.
    pub fpn_id0: Option<String>,
    /// Network id bound to `fpn1`.
    pub fpn_id1: Option<String>,
    /// Rendezvous (moon) id.
    pub moon_id0: Option<String>,
    /// Rendezvous IPv4 address.
    pub moon_addr: Option<String>,
    /// Reference returned by the last configuration request.
    pub cfg_ref: Option<String>,
    /// A "wedged" notice has been sent for the exit route.
    pub wdg_ref: bool,
    /// Reachability of the exit route, once checked.
    pub route: Option<bool>,
    /// Reference of the last message exchanged with the moon.
    pub msg_ref: Option<String>,
}

impl NodeState {
    /// Build a state from loose key/value pairs, rejecting unknown keys.
    pub fn from_pairs<'a, I>(pairs: I) -> FpndResult<Self>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let mut state = NodeState::default();
        for (key, value) in pairs {
            let key: StateKey = key.parse()?;
            state.set(key, value)?;
        }
        Ok(state)
    }

    /// Read one field as a JSON value.
    pub fn get(&self, key: StateKey) -> Value {
        fn opt(v: &Option<String>) -> Value {
            v.as_ref().map(|s| Value::String(s.clone())).unwrap_or(Value::Null)
        }
        match key {
            StateKey::FpnId => opt(&self.fpn_id),
            StateKey::Fpn0 => Value::Bool(self.fpn0),
            StateKey::Fpn1 => Value::Bool(self.fpn1),
            StateKey::FpnId0 => opt(&self.fpn_id0),
            StateKey::FpnId1 => opt(&self.fpn_id1),
            StateKey::MoonId0 => opt(&self.moon_id0),
            StateKey::MoonAddr => opt(&self.moon_addr),
            StateKey::CfgRef => opt(&self.cfg_ref),
            StateKey::WdgRef => Value::Bool(self.wdg_ref),
            StateKey::Route => self.route.map(Value::Bool).unwrap_or(Value::Null),
            StateKey::MsgRef => opt(&self.msg_ref),
        }
    }

    /// Write one field from a JSON value, checking the field's type.
    pub fn set(&mut self, key: StateKey, value: Value) -> FpndResult<()> {
        fn opt(key: StateKey, v: Value) -> FpndResult<Option<String>> {
            match v {
                Value::Null => Ok(None),
                Value::String(s) => Ok(Some(s)),
                other => Err(FpndError::Decode(format!("{key}: expected string, got {other}"))),
            }
        }
        fn flag(key: StateKey, v: Value) -> FpndResult<bool> {
            match v {
                Value::Bool(b) => Ok(b),
                Value::Null => Ok(false),
                other => Err(FpndError::Decode(format!("{key}: expected bool, got {other}"))),
            }
        }
        match key {
            StateKey::FpnId => self.fpn_id = opt(key, value)?,
            StateKey::Fpn0 => self.fpn0 = flag(key, value)?,
            StateKey::Fpn1 => self.fpn1 = flag(key, value)?,
            StateKey::FpnId0 => self.fpn_id0 = opt(key, value)?,
            StateKey::FpnId1 => self.fpn_id1 = opt(key, value)?,
            StateKey::MoonId0 => self.moon_id0 = opt(key, value)?,
            StateKey::MoonAddr => self.moon_addr = opt(key, value)?,
            StateKey::CfgRef => self.cfg_ref = opt(key, value)?,
            StateKey::WdgRef => self.wdg_ref = flag(key, value)?,
            StateKey::Route => {
                self.route = match value {
                    Value::Null => None,
                    v => Some(flag(key, v)?),
                }
            }
            StateKey::MsgRef => self.msg_ref = opt(key, value)?,
        }
        Ok(())
    }

    pub fn is_up(&self, iface: Iface) -> bool {
        match iface {
            Iface::Fpn0 => self.fpn0,
            Iface::Fpn1 => self.fpn1,
        }
    }

    /// Network id bound to `iface`, only while the interface is up.
    pub fn network_for(&self, iface: Iface) -> Option<&str> {
        if !self.is_up(iface) {
            return None;
        }
        match iface {
            Iface::Fpn0 => self.fpn_id0.as_deref(),
            Iface::Fpn1 => self.fpn_id1.as_deref(),
        }
    }

    /// Interface currently bound to `nwid`, if any.
    pub fn iface_for(&self, nwid: &str) -> Option<Iface> {
        Iface::ALL
            .into_iter()
            .find(|i| self.network_for(*i) == Some(nwid))
    }

    /// Mark `iface` up and bind it to `nwid`.
    pub fn set_interface(&mut self, iface: Iface, nwid: &str) {
        match iface {
            Iface::Fpn0 => {
                self.fpn0 = true;
                self.fpn_id0 = Some(nwid.to_string());
            }
            Iface::Fpn1 => {
                self.fpn1 = true;
                self.fpn_id1 = Some(nwid.to_string());
            }
        }
    }

    /// Mark `iface` down and drop its network binding.
    pub fn clear_interface(&mut self, iface: Iface) {
        match iface {
            Iface::Fpn0 => {
                self.fpn0 = false;
                self.fpn_id0 = None;
            }
            Iface::Fpn1 => {
                self.fpn1 = false;
                self.fpn_id1 = None;
            }
        }
    }

    /// Changes needed to go from `self` to `after`.
    pub fn diff(&self, after: &NodeState) -> StateDiff {
        let mut changes: Vec<StateChange> = StateKey::ALL
            .iter()
            .filter(|k| self.get(**k) != after.get(**k))
            .map(|k| StateChange::Plain {
                key: *k,
                value: after.get(*k),
            })
            .collect();

        // A network id that moved from one interface slot to the other shows
        // up as a single rename instead of an unrelated clear and set.
        for (from, to) in [
            (StateKey::FpnId0, StateKey::FpnId1),
            (StateKey::FpnId1, StateKey::FpnId0),
        ] {
            let moved = self.get(from);
            if moved.is_null() || after.get(to) != moved || self.get(to) == moved {
                continue;
            }
            let from_pos = changes.iter().position(|c| c.is_plain(from));
            let to_pos = changes.iter().position(|c| c.is_plain(to));
            if let (Some(from_pos), Some(to_pos)) = (from_pos, to_pos) {
                changes[from_pos] = StateChange::Rename {
                    old_key: from,
                    old_value: moved.clone(),
                    new_key: to,
                    new_value: after.get(to),
                };
                changes.remove(to_pos);
            }
        }

        StateDiff(changes)
    }
}

/// One entry of a [`StateDiff`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateChange {
    /// A field took a new value.
    Plain { key: StateKey, value: Value },
    /// A value moved from one key to another.
    Rename {
        old_key: StateKey,
        old_value: Value,
        new_key: StateKey,
        new_value: Value,
    },
}

impl StateChange {
    fn is_plain(&self, k: StateKey) -> bool {
        matches!(self, StateChange::Plain { key, .. } if *key == k)
    }

    /// Interface flag changes carried by this entry, as `(iface, is_up)`.
    pub fn iface_changes(&self) -> Vec<(Iface, bool)> {
        let as_up = |v: &Value| v.as_bool().unwrap_or(false);
        match self {
            StateChange::Plain { key, value } => key
                .iface()
                .map(|i| vec![(i, as_up(value))])
                .unwrap_or_default(),
            StateChange::Rename {
                old_key,
                old_value,
                new_key,
                new_value,
            } => [(old_key, old_value), (new_key, new_value)]
                .into_iter()
                .filter_map(|(k, v)| k.iface().map(|i| (i, as_up(v))))
                .collect(),
        }
    }
}

/// Ordered list of changes observed during one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDiff(pub Vec<StateChange>);

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StateChange> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a StateDiff {
    type Item = &'a StateChange;
    type IntoIter = std::slice::Iter<'a, StateChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
