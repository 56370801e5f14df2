//! Remote Object Model
//!
//! Value types for the management-object protocol. Remote objects are never
//! held by reference: an [`InstanceName`] is recomputed (or re-read) on every
//! call and resolved through the management client, because the array is the
//! source of truth and may change between two calls.

use crate::domain::classes::rc;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Key Bindings
// =============================================================================

/// Ordered identifying attributes of a remote instance
pub type KeyBindings = BTreeMap<String, String>;

/// Identity of a remote instance: class name plus key bindings
///
/// Serialized form doubles as the volume `provider_location`, the only
/// handle the host persists between calls.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceName {
    #[serde(rename = "classname")]
    pub class_name: String,
    pub keybindings: KeyBindings,
}

/// The durable volume handle retained by the host volume manager
pub type ProviderLocation = InstanceName;

impl InstanceName {
    /// Create an instance name with no key bindings
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            keybindings: KeyBindings::new(),
        }
    }

    /// Add a key binding
    pub fn with_key(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.keybindings.insert(key.into(), value.into());
        self
    }

    /// Look up a key binding value
    pub fn key(&self, key: &str) -> Option<&str> {
        self.keybindings.get(key).map(String::as_str)
    }

    /// Whether this name refers to an instance of `class_name`
    pub fn is_class(&self, class_name: &str) -> bool {
        self.class_name == class_name
    }

    /// Serialize as a provider location string
    pub fn to_provider_location(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a provider location string
    pub fn from_provider_location(location: &str) -> Result<Self> {
        let name: InstanceName = serde_json::from_str(location)
            .map_err(|e| Error::InvalidProviderLocation(format!("{}: {}", location, e)))?;
        if name.class_name.is_empty() || name.keybindings.is_empty() {
            return Err(Error::InvalidProviderLocation(format!(
                "{}: missing classname or keybindings",
                location
            )));
        }
        Ok(name)
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.class_name)?;
        let mut sep = '.';
        for (key, value) in &self.keybindings {
            write!(f, "{}{}=\"{}\"", sep, key, value)?;
            sep = ',';
        }
        Ok(())
    }
}

// =============================================================================
// Property Values
// =============================================================================

/// A property or method-argument value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
    Ref(InstanceName),
    List(Vec<Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; numeric strings are accepted since providers report
    /// 64-bit counters as strings.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&InstanceName> {
        match self {
            Value::Ref(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// References contained in a list value (or a single reference)
    pub fn refs(&self) -> Vec<InstanceName> {
        match self {
            Value::Ref(name) => vec![name.clone()],
            Value::List(items) => items.iter().filter_map(|v| v.as_reference().cloned()).collect(),
            _ => Vec::new(),
        }
    }

    /// Strings contained in a list value (or a single string)
    pub fn strings(&self) -> Vec<String> {
        match self {
            Value::Str(s) => vec![s.clone()],
            Value::List(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::Str(s.clone())
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(u64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<InstanceName> for Value {
    fn from(name: InstanceName) -> Self {
        Value::Ref(name)
    }
}

impl From<&InstanceName> for Value {
    fn from(name: &InstanceName) -> Self {
        Value::Ref(name.clone())
    }
}

impl From<Vec<InstanceName>> for Value {
    fn from(names: Vec<InstanceName>) -> Self {
        Value::List(names.into_iter().map(Value::Ref).collect())
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::List(items.into_iter().map(Value::Str).collect())
    }
}

// =============================================================================
// Instances
// =============================================================================

/// A remote instance as read from the array
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub path: InstanceName,
    pub properties: BTreeMap<String, Value>,
}

impl Instance {
    pub fn new(path: InstanceName) -> Self {
        Self {
            path,
            properties: BTreeMap::new(),
        }
    }

    /// Set a property
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// String attribute, looked up in properties first, then key bindings
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .and_then(Value::as_str)
            .or_else(|| self.path.key(name))
    }

    pub fn u64_prop(&self, name: &str) -> Option<u64> {
        self.properties.get(name).and_then(Value::as_u64)
    }

    pub fn bool_prop(&self, name: &str) -> bool {
        self.properties
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn ref_prop(&self, name: &str) -> Option<&InstanceName> {
        self.properties.get(name).and_then(Value::as_reference)
    }

    pub fn element_name(&self) -> Option<&str> {
        self.attr("ElementName")
    }
}

// =============================================================================
// Method Invocation
// =============================================================================

/// Named arguments of a remote method call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodArgs(BTreeMap<String, Value>);

impl MethodArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn u64(&self, name: &str) -> Option<u64> {
        self.0.get(name).and_then(Value::as_u64)
    }

    pub fn reference(&self, name: &str) -> Option<&InstanceName> {
        self.0.get(name).and_then(Value::as_reference)
    }

    pub fn refs(&self, name: &str) -> Vec<InstanceName> {
        self.0.get(name).map(Value::refs).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// Result of `invoke_method`: a return code plus output arguments
///
/// Asynchronous operations hand back a `Job` reference which must be polled
/// to a terminal state before the operation's effect can be relied upon.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    pub return_code: u32,
    pub outputs: BTreeMap<String, Value>,
}

impl InvokeOutcome {
    /// A synchronous, successful result with no outputs
    pub fn completed() -> Self {
        Self {
            return_code: rc::OK,
            outputs: BTreeMap::new(),
        }
    }

    /// An asynchronous result carrying a job handle
    pub fn job_started(job: InstanceName) -> Self {
        Self::completed()
            .with_return_code(rc::JOB_STARTED)
            .with_output("Job", job)
    }

    pub fn with_return_code(mut self, code: u32) -> Self {
        self.return_code = code;
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(name.into(), value.into());
        self
    }

    /// Job handle, when the operation completes asynchronously
    pub fn job(&self) -> Option<&InstanceName> {
        self.output_ref("Job")
    }

    pub fn output_ref(&self, name: &str) -> Option<&InstanceName> {
        self.outputs.get(name).and_then(Value::as_reference)
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_name() -> InstanceName {
        InstanceName::new("Symm_StorageVolume")
            .with_key("CreationClassName", "Symm_StorageVolume")
            .with_key("SystemName", "SYMMETRIX+000195900551")
            .with_key("DeviceID", "1")
            .with_key("SystemCreationClassName", "Symm_StorageSystem")
    }

    #[test]
    fn test_provider_location_parse() {
        let location = r#"{"classname":"Symm_StorageVolume","keybindings":{"DeviceID":"1","SystemName":"SYMMETRIX+000195900551"}}"#;
        let name = InstanceName::from_provider_location(location).unwrap();
        assert_eq!(name.class_name, "Symm_StorageVolume");
        assert_eq!(name.key("DeviceID"), Some("1"));

        let round = InstanceName::from_provider_location(&volume_name().to_provider_location().unwrap()).unwrap();
        assert_eq!(round, volume_name());
    }

    #[test]
    fn test_provider_location_rejects_garbage() {
        assert!(matches!(
            InstanceName::from_provider_location("not json"),
            Err(Error::InvalidProviderLocation(_))
        ));
        assert!(matches!(
            InstanceName::from_provider_location(r#"{"classname":"X","keybindings":{}}"#),
            Err(Error::InvalidProviderLocation(_))
        ));
    }

    #[test]
    fn test_display_is_canonical() {
        let name = InstanceName::new("SE_ConcreteJob").with_key("InstanceID", "9999");
        assert_eq!(name.to_string(), "SE_ConcreteJob.InstanceID=\"9999\"");
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from("512").as_u64(), Some(512));
        assert_eq!(Value::Int(-1).as_u64(), None);
        assert_eq!(Value::from("true").as_bool(), Some(true));
        let list = Value::from(vec![volume_name(), volume_name()]);
        assert_eq!(list.refs().len(), 2);
    }

    #[test]
    fn test_instance_attr_falls_back_to_keys() {
        let inst = Instance::new(volume_name()).with("ElementName", "vol1");
        assert_eq!(inst.element_name(), Some("vol1"));
        assert_eq!(inst.attr("DeviceID"), Some("1"));
        assert!(!inst.bool_prop("IsComposite"));
    }

    #[test]
    fn test_invoke_outcome_job() {
        let job = InstanceName::new("SE_ConcreteJob").with_key("InstanceID", "1");
        let outcome = InvokeOutcome::job_started(job.clone());
        assert_eq!(outcome.return_code, rc::JOB_STARTED);
        assert_eq!(outcome.job(), Some(&job));
        assert!(InvokeOutcome::completed().job().is_none());
    }
}
