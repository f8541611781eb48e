//! Handle-based engine operations on top of one `Transport`.
//!
//! Every handle the session hands out is tagged with the transport generation
//! that produced it. Handles from another generation are rejected with
//! `EngineError::StaleHandle` before anything is sent.

use std::collections::HashMap;

use engine_broker_core::{
    EngineError, FieldSelection, GLOBAL_HANDLE, ObjectHandle, SelectionState, VariableState,
    VariableValue,
};
use engine_broker_transport::{
    Transport,
    protocol::{methods, returned_generic_id, returned_handle},
};
use serde_json::{Value, json};
use uuid::Uuid;

/// Bookkeeping needed to destroy an object later.
#[derive(Debug, Clone)]
struct LiveObject {
    object_type: String,
    generic_id: String,
}

/// Create/destroy method pair for an object type.
fn lifecycle_methods(object_type: &str) -> (&'static str, &'static str) {
    match object_type.to_ascii_lowercase().as_str() {
        "bookmark" => (methods::CREATE_BOOKMARK, methods::DESTROY_BOOKMARK),
        "dimension" => (methods::CREATE_DIMENSION, methods::DESTROY_DIMENSION),
        "measure" => (methods::CREATE_MEASURE, methods::DESTROY_MEASURE),
        "variable" => (methods::CREATE_VARIABLE, methods::DESTROY_VARIABLE),
        _ => (
            methods::CREATE_SESSION_OBJECT,
            methods::DESTROY_SESSION_OBJECT,
        ),
    }
}

/// Properties as sent to the engine: `qInfo.qType` filled in when absent.
fn wire_properties(object_type: &str, properties: &Value) -> Value {
    let mut wire = properties.clone();
    if let Value::Object(map) = &mut wire {
        let info = map
            .entry("qInfo")
            .or_insert_with(|| json!({}));
        if let Value::Object(info) = info {
            info.entry("qType")
                .or_insert_with(|| Value::String(object_type.to_string()));
        }
    }
    wire
}

/// Selection values are sent as text.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn missing(what: &str, method: &str) -> EngineError {
    EngineError::Protocol(format!("{method} returned no {what}"))
}

/// One open document on one engine connection.
pub struct EngineSession {
    transport: Transport,
    document_id: String,
    engine_version: Option<String>,
    document: Option<ObjectHandle>,
    objects: HashMap<ObjectHandle, LiveObject>,
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("document_id", &self.document_id)
            .field("document", &self.document)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl EngineSession {
    /// Connect the transport if needed and open `document_id`.
    ///
    /// # Errors
    /// Returns `EngineError::SessionOpen` wrapping the transport or engine error.
    pub async fn open(
        transport: Transport,
        document_id: impl Into<String>,
    ) -> Result<Self, EngineError> {
        let mut session = Self {
            transport,
            document_id: document_id.into(),
            engine_version: None,
            document: None,
            objects: HashMap::new(),
        };
        session
            .handshake()
            .await
            .map_err(|e| EngineError::SessionOpen(Box::new(e)))?;
        Ok(session)
    }

    async fn handshake(&mut self) -> Result<(), EngineError> {
        let generation = self.transport.connect().await?;

        let version = self
            .transport
            .call(methods::ENGINE_VERSION, GLOBAL_HANDLE, json!({}))
            .await?;
        self.engine_version = version
            .pointer("/qVersion/qComponentVersion")
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let document = self.open_document(generation).await?;
        tracing::info!(
            document_id = %self.document_id,
            generation,
            handle = %document,
            engine_version = self.engine_version.as_deref().unwrap_or("unknown"),
            "Document opened"
        );
        Ok(())
    }

    async fn open_document(&mut self, generation: u64) -> Result<ObjectHandle, EngineError> {
        let result = self
            .transport
            .call(methods::OPEN_DOC, GLOBAL_HANDLE, json!([self.document_id]))
            .await?;
        let remote = returned_handle(&result).ok_or_else(|| missing("handle", methods::OPEN_DOC))?;

        // The socket may have been replaced while the call was in flight
        if self.transport.generation() != generation {
            return Err(EngineError::ConnectionLost);
        }

        let document = ObjectHandle::new(generation, remote);
        self.document = Some(document);
        Ok(document)
    }

    /// Remote handle of the document, re-opening it after a reconnect.
    async fn document(&mut self) -> Result<i64, EngineError> {
        let generation = self.transport.generation();
        if let Some(document) = self.document.filter(|d| d.is_live_in(generation)) {
            return Ok(document.remote());
        }

        tracing::info!(
            document_id = %self.document_id,
            generation,
            dropped_objects = self.objects.len(),
            "Re-opening document on new connection"
        );
        // Objects of the old connection died with it
        self.objects.clear();
        Ok(self.open_document(generation).await?.remote())
    }

    /// Remote handle number if `handle` belongs to the current generation.
    fn check(&self, handle: ObjectHandle) -> Result<i64, EngineError> {
        let current_generation = self.transport.generation();
        if handle.is_live_in(current_generation) {
            Ok(handle.remote())
        } else {
            Err(EngineError::StaleHandle {
                handle,
                current_generation,
            })
        }
    }

    #[must_use]
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Component version reported during the handshake.
    #[must_use]
    pub fn engine_version(&self) -> Option<&str> {
        self.engine_version.as_deref()
    }

    /// Current transport generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.transport.generation()
    }

    /// Document handle, tagged with the generation it was opened on.
    #[must_use]
    pub const fn document_handle(&self) -> Option<ObjectHandle> {
        self.document
    }

    /// Create an object, using the type's dedicated creation call where the
    /// engine has one and a session object otherwise.
    ///
    /// # Errors
    /// Returns transport/remote errors, or `EngineError::Protocol` if the
    /// engine's answer has no handle.
    pub async fn create_object(
        &mut self,
        object_type: &str,
        properties: &Value,
    ) -> Result<ObjectHandle, EngineError> {
        let (create, _) = lifecycle_methods(object_type);
        let document = self.document().await?;
        let generation = self.transport.generation();

        let result = self
            .transport
            .call(create, document, json!([wire_properties(object_type, properties)]))
            .await?;
        let remote = returned_handle(&result).ok_or_else(|| missing("handle", create))?;
        let generic_id = returned_generic_id(&result)
            .or_else(|| properties.pointer("/qInfo/qId").and_then(Value::as_str))
            .ok_or_else(|| missing("object id", create))?
            .to_string();

        if self.transport.generation() != generation {
            return Err(EngineError::ConnectionLost);
        }

        let handle = ObjectHandle::new(generation, remote);
        tracing::debug!(%handle, object_type, generic_id = %generic_id, "Object created");
        self.objects.insert(
            handle,
            LiveObject {
                object_type: object_type.to_string(),
                generic_id,
            },
        );
        Ok(handle)
    }

    /// Current properties of an object, as the engine reports them.
    ///
    /// # Errors
    /// Returns `EngineError::StaleHandle` for handles of another generation.
    pub async fn get_object(&self, handle: ObjectHandle) -> Result<Value, EngineError> {
        let remote = self.check(handle)?;
        let result = self
            .transport
            .call(methods::GET_PROPERTIES, remote, json!([]))
            .await?;
        Ok(result.get("qProp").cloned().unwrap_or(result))
    }

    /// Destroy an object created through this session.
    ///
    /// Returns `false` without calling the engine for a handle this session
    /// does not hold (already destroyed, or only known from a restored registry).
    ///
    /// # Errors
    /// Returns `EngineError::StaleHandle` for handles of another generation.
    pub async fn destroy_object(&mut self, handle: ObjectHandle) -> Result<bool, EngineError> {
        self.check(handle)?;
        let Some(live) = self.objects.get(&handle).cloned() else {
            tracing::debug!(%handle, "Destroy skipped, object not held by this session");
            return Ok(false);
        };
        let (_, destroy) = lifecycle_methods(&live.object_type);
        let document = self.document().await?;

        let result = self
            .transport
            .call(destroy, document, json!([live.generic_id]))
            .await?;
        self.objects.remove(&handle);

        Ok(result
            .get("qSuccess")
            .and_then(Value::as_bool)
            .unwrap_or(true))
    }

    /// Call an arbitrary method on an object. Params and result pass through untouched.
    ///
    /// # Errors
    /// Returns `EngineError::StaleHandle` for handles of another generation.
    pub async fn invoke_method(
        &self,
        handle: ObjectHandle,
        method: &str,
        params: Value,
    ) -> Result<Value, EngineError> {
        let remote = self.check(handle)?;
        self.transport.call(method, remote, params).await
    }

    /// Create a throwaway session object, read its layout, destroy it.
    async fn read_layout(&mut self, object_type: &str, definition: Value) -> Result<Value, EngineError> {
        let document = self.document().await?;
        let generic_id = format!("broker-{}-{}", object_type.to_ascii_lowercase(), Uuid::new_v4().simple());

        let mut properties = definition;
        properties["qInfo"] = json!({"qId": generic_id, "qType": object_type});
        let created = self
            .transport
            .call(methods::CREATE_SESSION_OBJECT, document, json!([properties]))
            .await?;
        let remote = returned_handle(&created)
            .ok_or_else(|| missing("handle", methods::CREATE_SESSION_OBJECT))?;

        let layout = self
            .transport
            .call(methods::GET_LAYOUT, remote, json!([]))
            .await;

        if let Err(e) = self
            .transport
            .call(methods::DESTROY_SESSION_OBJECT, document, json!([generic_id]))
            .await
        {
            tracing::warn!(generic_id = %generic_id, "Failed to destroy helper object: {e}");
        }

        Ok(layout?.get("qLayout").cloned().unwrap_or(Value::Null))
    }

    /// Fields with selections and their selected values.
    ///
    /// # Errors
    /// Returns transport/remote errors.
    pub async fn get_selection_state(&mut self) -> Result<SelectionState, EngineError> {
        let layout = self
            .read_layout("CurrentSelections", json!({"qSelectionObjectDef": {}}))
            .await?;

        let fields = layout
            .pointer("/qSelectionObject/qSelections")
            .and_then(Value::as_array)
            .map(|selections| {
                selections
                    .iter()
                    .filter_map(|s| {
                        let field = s.get("qField")?.as_str()?.to_string();
                        let values = s
                            .get("qSelectedFieldSelectionInfo")
                            .and_then(Value::as_array)
                            .map(|info| {
                                info.iter()
                                    .filter_map(|v| v.get("qName").cloned())
                                    .collect()
                            })
                            .unwrap_or_default();
                        Some(FieldSelection { field, values })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(SelectionState { fields })
    }

    /// Clear all selections, then select each field's values in order.
    ///
    /// Stops at the first failing field without undoing earlier ones.
    ///
    /// # Errors
    /// Returns the clear error as is, or `EngineError::PartialApply` naming the
    /// field that failed and how many were applied before it.
    pub async fn set_selection_state(&mut self, state: &SelectionState) -> Result<(), EngineError> {
        let document = self.document().await?;
        self.transport
            .call(methods::CLEAR_ALL, document, json!([false]))
            .await?;

        for (applied, selection) in state.fields.iter().enumerate() {
            self.select_field(document, selection)
                .await
                .map_err(|source| EngineError::PartialApply {
                    stage: "selections",
                    field: selection.field.clone(),
                    applied,
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    async fn select_field(&self, document: i64, selection: &FieldSelection) -> Result<(), EngineError> {
        let field = self
            .transport
            .call(methods::GET_FIELD, document, json!([selection.field]))
            .await?;
        let field = returned_handle(&field).ok_or_else(|| missing("handle", methods::GET_FIELD))?;

        let values: Vec<Value> = selection
            .values
            .iter()
            .map(|v| json!({"qText": as_text(v), "qIsNumeric": v.is_number(), "qNumber": v.as_f64().unwrap_or(0.0)}))
            .collect();
        self.transport
            .call(methods::SELECT_VALUES, field, json!([values, false, false]))
            .await?;
        Ok(())
    }

    /// Document variables and their definitions.
    ///
    /// # Errors
    /// Returns transport/remote errors.
    pub async fn get_variable_state(&mut self) -> Result<VariableState, EngineError> {
        let layout = self
            .read_layout(
                "VariableList",
                json!({"qVariableListDef": {"qType": "variable", "qData": {"definition": "/qDefinition"}}}),
            )
            .await?;

        let variables = layout
            .pointer("/qVariableList/qItems")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        Some(VariableValue {
                            name: item.get("qName")?.as_str()?.to_string(),
                            definition: item.get("qDefinition").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(VariableState { variables })
    }

    /// Set each variable in order. Stops at the first failure without undoing
    /// earlier ones.
    ///
    /// # Errors
    /// Returns `EngineError::PartialApply` naming the variable that failed.
    pub async fn set_variable_state(&mut self, state: &VariableState) -> Result<(), EngineError> {
        let document = self.document().await?;

        for (applied, variable) in state.variables.iter().enumerate() {
            self.set_variable(document, variable)
                .await
                .map_err(|source| EngineError::PartialApply {
                    stage: "variables",
                    field: variable.name.clone(),
                    applied,
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }

    async fn set_variable(&self, document: i64, variable: &VariableValue) -> Result<(), EngineError> {
        let found = self
            .transport
            .call(methods::GET_VARIABLE_BY_NAME, document, json!([variable.name]))
            .await?;
        let handle = returned_handle(&found)
            .ok_or_else(|| missing("handle", methods::GET_VARIABLE_BY_NAME))?;
        self.transport
            .call(
                methods::SET_STRING_VALUE,
                handle,
                json!([as_text(&variable.definition)]),
            )
            .await?;
        Ok(())
    }

    /// Forget all handles and close the transport.
    pub async fn close(mut self) {
        self.objects.clear();
        self.document = None;
        self.transport.close().await;
        tracing::debug!(document_id = %self.document_id, "Engine session closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use engine_broker_core::TransportConfig;
    use engine_broker_transport::{TransportOptions, TransportState, fake::FakeEngine};

    use super::*;

    fn transport(engine: &FakeEngine) -> Transport {
        Transport::spawn(TransportOptions::new("fake://engine", engine.connector()))
    }

    async fn open(engine: &FakeEngine) -> EngineSession {
        EngineSession::open(transport(engine), "D1").await.unwrap()
    }

    #[test]
    fn test_lifecycle_dispatch() {
        assert_eq!(lifecycle_methods("Bookmark").0, methods::CREATE_BOOKMARK);
        assert_eq!(lifecycle_methods("measure").1, methods::DESTROY_MEASURE);
        assert_eq!(lifecycle_methods("barchart").0, methods::CREATE_SESSION_OBJECT);
    }

    #[test]
    fn test_wire_properties_adds_type() {
        let wire = wire_properties("Generic", &json!({"a": 1}));
        assert_eq!(wire, json!({"a": 1, "qInfo": {"qType": "Generic"}}));

        let kept = wire_properties("Generic", &json!({"qInfo": {"qType": "table", "qId": "t"}}));
        assert_eq!(kept["qInfo"]["qType"], "table");
    }

    #[tokio::test]
    async fn test_open_handshake() {
        let engine = FakeEngine::new();
        let session = open(&engine).await;

        assert_eq!(session.engine_version(), Some("fake-engine-1.0"));
        assert_eq!(session.generation(), 1);
        let document = session.document_handle().unwrap();
        assert_eq!(document.generation(), 1);

        let sent: Vec<String> = engine.requests().into_iter().map(|r| r.method).collect();
        assert_eq!(sent, vec![methods::ENGINE_VERSION, methods::OPEN_DOC]);
    }

    #[tokio::test]
    async fn test_open_failure_is_session_open_error() {
        let engine = FakeEngine::new();
        engine.hide_document("D1");
        let err = EngineSession::open(transport(&engine), "D1").await.unwrap_err();
        match err {
            EngineError::SessionOpen(inner) => {
                assert!(matches!(*inner, EngineError::Remote { .. }));
            }
            other => panic!("Expected SessionOpen, got {other:?}"),
        }

        engine.refuse_connections(1);
        let err = EngineSession::open(transport(&engine), "D2").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionOpen(ref inner) if matches!(**inner, EngineError::Connection(_))));
    }

    #[tokio::test]
    async fn test_create_get_destroy() {
        let engine = FakeEngine::new();
        let mut session = open(&engine).await;

        let handle = session
            .create_object("Generic", &json!({"qInfo": {"qId": "g1"}, "a": 1}))
            .await
            .unwrap();
        assert_eq!(handle.generation(), 1);

        let props = session.get_object(handle).await.unwrap();
        assert_eq!(props["a"], 1);
        assert_eq!(props["qInfo"]["qType"], "Generic");

        let echoed = session
            .invoke_method(handle, "EchoSomething", json!({"x": true}))
            .await
            .unwrap();
        assert_eq!(echoed["qId"], "g1");

        assert!(session.destroy_object(handle).await.unwrap());
        assert_eq!(engine.request_count(methods::DESTROY_SESSION_OBJECT), 1);
        assert!(!session.destroy_object(handle).await.unwrap());
        assert_eq!(engine.request_count(methods::DESTROY_SESSION_OBJECT), 1);
    }

    #[tokio::test]
    async fn test_bookmark_uses_dedicated_call() {
        let engine = FakeEngine::new();
        let mut session = open(&engine).await;

        let handle = session
            .create_object("Bookmark", &json!({"qInfo": {"qId": "bm"}}))
            .await
            .unwrap();
        session.destroy_object(handle).await.unwrap();

        assert_eq!(engine.request_count(methods::CREATE_BOOKMARK), 1);
        assert_eq!(engine.request_count(methods::DESTROY_BOOKMARK), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handle_after_reconnect_makes_no_call() {
        let engine = FakeEngine::new();
        let mut session = open(&engine).await;
        let handle = session.create_object("Generic", &json!({})).await.unwrap();

        let mut status = session.transport().watch_status();
        engine.drop_connections();
        status
            .wait_for(|s| s.state == TransportState::Connected && s.generation == 2)
            .await
            .unwrap();

        let before = engine.requests().len();
        let err = session.get_object(handle).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::StaleHandle { current_generation: 2, .. }
        ));
        assert!(matches!(
            session.invoke_method(handle, "GetLayout", json!([])).await,
            Err(EngineError::StaleHandle { .. })
        ));
        assert!(matches!(
            session.destroy_object(handle).await,
            Err(EngineError::StaleHandle { .. })
        ));
        assert_eq!(engine.requests().len(), before);

        // Document-level calls re-open the document on the new connection
        let fresh = session.create_object("Generic", &json!({})).await.unwrap();
        assert_eq!(fresh.generation(), 2);
        assert_eq!(session.document_handle().unwrap().generation(), 2);
        assert_eq!(engine.request_count(methods::OPEN_DOC), 2);
    }

    #[tokio::test]
    async fn test_selection_state_round_trip() {
        let engine = FakeEngine::new();
        let mut session = open(&engine).await;
        engine.select("D1", "Region", vec![json!("North"), json!("West")]);

        let saved = session.get_selection_state().await.unwrap();
        assert_eq!(saved.fields.len(), 1);
        assert_eq!(saved.fields[0].field, "Region");

        engine.select("D1", "Year", vec![json!("2020")]);
        session.set_selection_state(&saved).await.unwrap();

        let selections = engine.selections("D1");
        assert_eq!(selections.len(), 1);
        assert_eq!(selections["Region"], vec![json!("North"), json!("West")]);
    }

    #[tokio::test]
    async fn test_variable_partial_apply_names_failing_variable() {
        let engine = FakeEngine::new();
        engine.set_variable("D1", "vA", json!("1"));
        engine.set_variable("D1", "vB", json!("2"));
        let mut session = open(&engine).await;

        let state = VariableState {
            variables: vec![
                VariableValue {
                    name: "vA".into(),
                    definition: json!("10"),
                },
                VariableValue {
                    name: "vMissing".into(),
                    definition: json!("x"),
                },
                VariableValue {
                    name: "vB".into(),
                    definition: json!("20"),
                },
            ],
        };

        match session.set_variable_state(&state).await {
            Err(EngineError::PartialApply {
                stage,
                field,
                applied,
                source,
            }) => {
                assert_eq!(stage, "variables");
                assert_eq!(field, "vMissing");
                assert_eq!(applied, 1);
                assert!(matches!(*source, EngineError::Remote { .. }));
            }
            other => panic!("Expected partial apply, got {other:?}"),
        }

        // No rollback of the first, nothing after the failure
        assert_eq!(engine.variable("D1", "vA"), Some(json!("10")));
        assert_eq!(engine.variable("D1", "vB"), Some(json!("2")));
    }

    #[tokio::test]
    async fn test_variable_state_read() {
        let engine = FakeEngine::new();
        engine.set_variable("D1", "vYear", json!("2024"));
        let mut session = open(&engine).await;

        let state = session.get_variable_state().await.unwrap();
        assert_eq!(
            state.variables,
            vec![VariableValue {
                name: "vYear".into(),
                definition: json!("2024"),
            }]
        );
        // Helper objects are cleaned up
        assert_eq!(
            engine.request_count(methods::CREATE_SESSION_OBJECT),
            engine.request_count(methods::DESTROY_SESSION_OBJECT)
        );
    }

    #[tokio::test]
    async fn test_close_closes_transport() {
        let engine = FakeEngine::new();
        let transport = Transport::spawn(
            TransportOptions::new("fake://engine", engine.connector())
                .config(TransportConfig::default())
                .credentials(Arc::new(engine_broker_core::NoCredentials), ""),
        );
        let session = EngineSession::open(transport.clone(), "D1").await.unwrap();
        session.close().await;
        assert_eq!(transport.state(), TransportState::Closed);
    }
}
