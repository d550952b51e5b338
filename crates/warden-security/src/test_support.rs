// test_support.rs — Shared fixtures for unit tests.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, RwLock};

use crate::checker::SecurityChecker;
use crate::error::ObjectError;
use crate::interaction::Participation;
use crate::interface::Interface;
use crate::operation::{BinaryOp, Operation};
use crate::permission::Permission;
use crate::policy::SecurityPolicy;
use crate::value::{Object, Value};

/// A record with named fields and a handful of operators.
#[derive(Debug, Default)]
pub(crate) struct Record {
    fields: RwLock<BTreeMap<String, Value>>,
    checker: Option<Arc<dyn SecurityChecker>>,
}

impl Record {
    pub(crate) fn value() -> Value {
        Value::object(Record::default())
    }

    pub(crate) fn with(fields: &[(&str, Value)]) -> Value {
        let record = Record::default();
        {
            let mut map = record.fields.write().unwrap();
            for (name, value) in fields {
                map.insert(name.to_string(), value.clone());
            }
        }
        Value::object(record)
    }

    pub(crate) fn with_checker(checker: Arc<dyn SecurityChecker>) -> Value {
        Value::object(Record {
            fields: RwLock::default(),
            checker: Some(checker),
        })
    }

    fn len(&self) -> i64 {
        self.fields.read().unwrap().len() as i64
    }
}

impl Object for Record {
    fn get_attr(&self, name: &str) -> Result<Value, ObjectError> {
        self.fields
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ObjectError::no_attribute("Record", name))
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), ObjectError> {
        self.fields.write().unwrap().insert(name.to_string(), value);
        Ok(())
    }

    fn del_attr(&self, name: &str) -> Result<(), ObjectError> {
        self.fields
            .write()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ObjectError::no_attribute("Record", name))
    }

    fn call_method(&self, name: &str, _args: &[Value]) -> Result<Value, ObjectError> {
        match name {
            "describe" => Ok(Value::text(format!("Record with {} fields", self.len()))),
            "child" => Ok(Record::with(&[("title", Value::text("child"))])),
            _ => Err(ObjectError::no_attribute("Record", name)),
        }
    }

    fn invoke(&self, op: Operation, args: &[Value]) -> Result<Value, ObjectError> {
        let operand = || args.first().and_then(Value::as_int).unwrap_or(0);
        match op {
            Operation::Call => Ok(Value::text("called")),
            Operation::Len => Ok(Value::Int(self.len())),
            Operation::Binary(BinaryOp::Add) | Operation::Reflected(BinaryOp::Add) => {
                Ok(Value::Int(self.len() + operand()))
            }
            Operation::InPlace(BinaryOp::Add) => {
                let mut fields = self.fields.write().unwrap();
                let counter = fields.get("counter").and_then(Value::as_int).unwrap_or(0);
                fields.insert("counter".to_string(), Value::Int(counter + operand()));
                Ok(Value::None)
            }
            Operation::Display => Ok(Value::text(format!("Record({} fields)", self.len()))),
            _ => Err(ObjectError::unsupported("Record", op.name())),
        }
    }

    fn interfaces(&self) -> Vec<Interface> {
        vec![Interface::new("IRecord").with_names(["title", "body"])]
    }

    fn security_checker(&self) -> Option<Arc<dyn SecurityChecker>> {
        self.checker.clone()
    }
}

/// Policy granting a mutable set of permission ids to everyone.
#[derive(Debug, Default)]
pub(crate) struct FixedPolicy {
    granted: RwLock<HashSet<String>>,
}

impl FixedPolicy {
    pub(crate) fn granting(permissions: &[&str]) -> Arc<Self> {
        let policy = FixedPolicy::default();
        for p in permissions {
            policy.grant(p);
        }
        Arc::new(policy)
    }

    pub(crate) fn grant(&self, permission: &str) {
        self.granted.write().unwrap().insert(permission.to_string());
    }
}

impl SecurityPolicy for FixedPolicy {
    fn name(&self) -> &str {
        "fixed"
    }

    fn check_permission(&self, permission: &Permission, _: &Value, _: &[Participation]) -> bool {
        self.granted.read().unwrap().contains(permission.id())
    }
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl io::Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a subscriber that records every event, returning the output.
pub(crate) fn capture_logs(f: impl FnOnce()) -> String {
    let capture = Capture::default();
    let writer = capture.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    let bytes = capture.0.lock().unwrap().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}
