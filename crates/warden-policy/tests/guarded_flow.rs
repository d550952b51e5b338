// guarded_flow.rs — End-to-end test of configuration, declarations and guards.
//
// The flow:
//
//   1. Load a YAML security config from disk (grants for alice)
//   2. Apply it to a fresh registry and build the grant policy
//   3. Declare how `Document` instances are protected
//   4. Guard a document and work with it as alice, then as bob
//   5. Traverse into nested values and confirm they are guarded too
//   6. Run two interactions on separate tokio tasks
//
// VERIFY:
//   - Reads and writes follow the declared permissions per principal
//   - Undeclared names are forbidden, allow-listed ones are not
//   - Values returned from the document are themselves guarded
//   - can_read / can_write agree with the actual access outcome

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tempfile::tempdir;

use warden_policy::{declare, Declaration, SecurityConfig};
use warden_security::interaction::{self, scope};
use warden_security::{
    can_read, can_write, remove_guard, Interface, Object, ObjectError, Participation, Principal,
    Registry, SecurityError, SecurityPolicy, TypeKey, Value,
};

#[derive(Debug, Default)]
struct Document {
    fields: RwLock<BTreeMap<String, Value>>,
}

impl Document {
    fn new(title: &str, body: &str, tags: &[&str]) -> Value {
        let doc = Document::default();
        {
            let mut fields = doc.fields.write().unwrap();
            fields.insert("title".into(), Value::text(title));
            fields.insert("body".into(), Value::text(body));
            fields.insert(
                "tags".into(),
                Value::list(tags.iter().map(|t| Value::text(t))),
            );
        }
        Value::object(doc)
    }
}

impl Object for Document {
    fn get_attr(&self, name: &str) -> Result<Value, ObjectError> {
        self.fields
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ObjectError::no_attribute("Document", name))
    }

    fn set_attr(&self, name: &str, value: Value) -> Result<(), ObjectError> {
        self.fields.write().unwrap().insert(name.to_string(), value);
        Ok(())
    }

    fn call_method(&self, name: &str, _args: &[Value]) -> Result<Value, ObjectError> {
        match name {
            "summary" => {
                let title = self.get_attr("title")?;
                Ok(Value::text(format!("Document: {title}")))
            }
            "related" => Ok(Document::new("Related", "more secrets", &[])),
            _ => Err(ObjectError::no_attribute("Document", name)),
        }
    }

    fn interfaces(&self) -> Vec<Interface> {
        vec![readable()]
    }
}

fn readable() -> Interface {
    Interface::new("IReadableDocument").with_names(["body", "tags"])
}

const CONFIG: &str = r#"
checkers:
  verbosity: decisions
  available_by_default: ["summary"]
policy:
  kind: grants
  grants:
    - principal: alice
      permissions: ["content.*"]
    - principal: bob
      permissions: ["content.View"]
"#;

fn setup() -> (Registry, Arc<dyn SecurityPolicy>) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("security.yaml");
    std::fs::write(&path, CONFIG).unwrap();
    let config = SecurityConfig::load(&path).unwrap();

    let registry = Registry::new();
    config.apply(&registry);
    // Lists of tags are handed out read-only.
    declare(
        &registry,
        TypeKey::list(),
        &[Declaration::require("content.View", ["iter", "len", "get_item"])],
    )
    .unwrap();
    declare(
        &registry,
        TypeKey::of::<Document>(),
        &[
            Declaration::allow(["title"]),
            Declaration::require("content.View", ["related"]).with_interface(readable()),
            Declaration::require_write("content.Edit", ["title", "body"]),
        ],
    )
    .unwrap();

    (registry, config.build_policy().unwrap())
}

fn principal(id: &str) -> Vec<Participation> {
    vec![Participation::new(Some(Arc::new(Principal::new(id, id))))]
}

#[test]
fn document_access_follows_declarations() {
    let (registry, policy) = setup();
    let doc = registry
        .guard(Document::new("Plans", "the secret plan", &["q3", "internal"]), None)
        .unwrap();

    // =========================================================
    // Alice holds content.* and may read and edit.
    // =========================================================
    {
        let _active = interaction::enter(policy.clone(), principal("alice")).unwrap();
        assert_eq!(doc.get_attr("title").unwrap(), Value::text("Plans"));
        assert_eq!(doc.get_attr("body").unwrap(), Value::text("the secret plan"));
        doc.set_attr("title", Value::text("Plans v2")).unwrap();
        assert!(can_write(&registry, &doc, "body").unwrap());

        // Allow-listed through config.
        assert_eq!(
            doc.call_method("summary", &[]).unwrap(),
            Value::text("Document: Plans v2")
        );

        // Nested values come back guarded.
        let tags = doc.get_attr("tags").unwrap();
        assert!(tags.is_guarded());
        assert_eq!(tags.len().unwrap(), 2);
        assert!(tags.call_method("push", &[Value::text("leak")]).unwrap_err().is_forbidden());

        let related = doc.call_method("related", &[]).unwrap();
        assert!(related.is_guarded());
        assert_eq!(related.get_attr("body").unwrap(), Value::text("more secrets"));
    }

    // =========================================================
    // Bob may view but not edit.
    // =========================================================
    {
        let _active = interaction::enter(policy.clone(), principal("bob")).unwrap();
        assert_eq!(doc.get_attr("body").unwrap(), Value::text("the secret plan"));
        assert!(doc
            .set_attr("title", Value::text("Hijacked"))
            .unwrap_err()
            .is_unauthorized());
        assert!(!can_write(&registry, &doc, "title").unwrap());
        assert!(can_read(&registry, &doc, "body").unwrap());
    }

    // =========================================================
    // Carol holds nothing.
    // =========================================================
    {
        let _active = interaction::enter(policy.clone(), principal("carol")).unwrap();
        assert_eq!(doc.get_attr("title").unwrap(), Value::text("Plans v2"));
        let err = doc.get_attr("body").unwrap_err();
        assert!(err.is_unauthorized());
        // The error names the type, never the value.
        assert!(!err.to_string().contains("secret"));
        assert!(!can_read(&registry, &doc, "body").unwrap());

        assert!(doc.get_attr("owner").unwrap_err().is_forbidden());
        assert!(can_read(&registry, &doc, "owner").unwrap_err().is_forbidden());
    }

    // Without an interaction, only public names work.
    assert_eq!(doc.get_attr("title").unwrap(), Value::text("Plans v2"));
    assert_eq!(
        doc.get_attr("body").unwrap_err(),
        SecurityError::NoActiveInteraction
    );

    // The escape hatch bypasses everything.
    assert_eq!(
        remove_guard(&doc).get_attr("body").unwrap(),
        Value::text("the secret plan")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interactions_are_isolated_per_task() {
    let (registry, policy) = setup();
    let doc = registry
        .guard(Document::new("Plans", "the secret plan", &[]), None)
        .unwrap();

    let as_user = |user: &'static str| {
        let doc = doc.clone();
        let policy = policy.clone();
        tokio::spawn(scope(async move {
            interaction::begin(policy, principal(user)).unwrap();
            tokio::task::yield_now().await;
            let readable = doc.get_attr("body").is_ok();
            interaction::end();
            readable
        }))
    };

    let alice = as_user("alice");
    let carol = as_user("carol");
    assert!(alice.await.unwrap());
    assert!(!carol.await.unwrap());
}
