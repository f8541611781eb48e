//! In-process fake engine for tests.
//!
//! Implements just the engine methods the broker issues, with controls for
//! refusing connections, dropping sockets and swallowing requests.
//!
//! # Example
//!
//! ```ignore
//! let engine = FakeEngine::new();
//! let transport = Transport::spawn(TransportOptions::new("fake://engine", engine.connector()));
//! transport.connect().await?;
//! engine.drop_connections(); // unsolicited drop
//! ```

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use engine_broker_core::{EngineError, GLOBAL_HANDLE};
use serde_json::{Value, json};
use tokio::sync::oneshot;

use crate::{
    connector::{Connector, Link, LinkPeer},
    protocol::{Request, Response, methods},
};

/// Remote error code for unknown methods.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Remote error code for missing documents, fields or variables.
pub const NOT_FOUND: i64 = 2;

#[derive(Debug, Default)]
struct Document {
    selections: BTreeMap<String, Vec<Value>>,
    variables: BTreeMap<String, Value>,
}

#[derive(Default)]
struct EngineState {
    refuse: u32,
    connections: u32,
    kill_switches: Vec<oneshot::Sender<()>>,
    headers: Vec<HashMap<String, String>>,
    swallowed: HashSet<String>,
    failing: HashMap<String, (i64, String)>,
    requests: Vec<Request>,
    documents: HashMap<String, Document>,
    missing_documents: HashSet<String>,
}

/// Controller for the fake engine. Cheap to clone.
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Arc<Mutex<EngineState>>,
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connector that opens links to this engine.
    #[must_use]
    pub fn connector(&self) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            engine: self.clone(),
        })
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: u32) {
        self.lock().refuse = n;
    }

    /// Close every open socket from the engine side.
    pub fn drop_connections(&self) {
        for kill in self.lock().kill_switches.drain(..) {
            let _ = kill.send(());
        }
    }

    /// Never answer calls to `method`.
    pub fn swallow(&self, method: &str) {
        self.lock().swallowed.insert(method.to_string());
    }

    /// Answer calls to `method` with an error frame.
    pub fn fail_method(&self, method: &str, code: i64, message: &str) {
        self.lock()
            .failing
            .insert(method.to_string(), (code, message.to_string()));
    }

    /// Make `OpenDoc` fail for `document_id`.
    pub fn hide_document(&self, document_id: &str) {
        self.lock().missing_documents.insert(document_id.to_string());
    }

    /// Successful connections so far.
    #[must_use]
    pub fn connections(&self) -> u32 {
        self.lock().connections
    }

    /// Headers presented by the most recent connection attempt.
    #[must_use]
    pub fn last_headers(&self) -> Option<HashMap<String, String>> {
        self.lock().headers.last().cloned()
    }

    /// Every request received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    /// How many calls to `method` were received.
    #[must_use]
    pub fn request_count(&self, method: &str) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    /// Define (or overwrite) a document variable.
    pub fn set_variable(&self, document_id: &str, name: &str, definition: Value) {
        self.lock()
            .documents
            .entry(document_id.to_string())
            .or_default()
            .variables
            .insert(name.to_string(), definition);
    }

    #[must_use]
    pub fn variable(&self, document_id: &str, name: &str) -> Option<Value> {
        self.lock()
            .documents
            .get(document_id)
            .and_then(|d| d.variables.get(name).cloned())
    }

    /// Select values in a field.
    pub fn select(&self, document_id: &str, field: &str, values: Vec<Value>) {
        self.lock()
            .documents
            .entry(document_id.to_string())
            .or_default()
            .selections
            .insert(field.to_string(), values);
    }

    /// Current selections of a document.
    #[must_use]
    pub fn selections(&self, document_id: &str) -> BTreeMap<String, Vec<Value>> {
        self.lock()
            .documents
            .get(document_id)
            .map(|d| d.selections.clone())
            .unwrap_or_default()
    }
}

/// Connector half of the fake engine.
pub struct FakeConnector {
    engine: FakeEngine,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Link, EngineError> {
        let kill_rx = {
            let mut state = self.engine.lock();
            state.headers.push(headers.clone());
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(EngineError::Connection("connection refused".into()));
            }
            state.connections += 1;
            let (kill_tx, kill_rx) = oneshot::channel();
            state.kill_switches.push(kill_tx);
            kill_rx
        };

        let (link, peer) = Link::pair();
        tokio::spawn(serve(self.engine.clone(), peer, kill_rx));
        Ok(link)
    }
}

#[derive(Debug, Clone)]
enum FakeObject {
    Doc(String),
    Generic { generic_id: String, props: Value },
    SelectionList { generic_id: String },
    VariableList { generic_id: String },
    Field(String),
    Variable(String),
}

impl FakeObject {
    fn generic_id(&self) -> Option<&str> {
        match self {
            Self::Generic { generic_id, .. }
            | Self::SelectionList { generic_id }
            | Self::VariableList { generic_id } => Some(generic_id),
            _ => None,
        }
    }
}

/// Per-socket engine session.
struct Connection {
    engine: FakeEngine,
    objects: HashMap<i64, FakeObject>,
    next_handle: i64,
}

async fn serve(engine: FakeEngine, mut peer: LinkPeer, mut kill_rx: oneshot::Receiver<()>) {
    let _ = peer.to_client.send(
        json!({"jsonrpc": "2.0", "method": "OnConnected", "params": {"qSessionState": "SESSION_CREATED"}})
            .to_string(),
    );

    let mut conn = Connection {
        engine,
        objects: HashMap::new(),
        next_handle: 1,
    };

    loop {
        tokio::select! {
            _ = &mut kill_rx => break,
            frame = peer.from_client.recv() => {
                let Some(text) = frame else { break };
                let Ok(request) = serde_json::from_str::<Request>(&text) else {
                    continue;
                };
                if let Some(response) = conn.handle(request) {
                    let text = serde_json::to_string(&response).unwrap_or_default();
                    if peer.to_client.send(text).is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn arg<'a>(params: &'a Value, index: usize, name: &str) -> Option<&'a Value> {
    match params {
        Value::Array(items) => items.get(index),
        Value::Object(map) => map.get(name),
        _ => None,
    }
}

fn arg_str(params: &Value, index: usize, name: &str) -> Option<String> {
    arg(params, index, name)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn returned(q_type: &str, handle: i64, generic_id: &str) -> Value {
    json!({"qReturn": {"qType": q_type, "qHandle": handle, "qGenericId": generic_id}})
}

impl Connection {
    fn handle(&mut self, request: Request) -> Option<Response> {
        let id = request.id;
        {
            let mut state = self.engine.lock();
            state.requests.push(request.clone());
            if state.swallowed.contains(&request.method) {
                return None;
            }
            if let Some((code, message)) = state.failing.get(&request.method) {
                return Some(Response::failure(id, *code, message.clone()));
            }
        }
        Some(match self.dispatch(&request) {
            Ok(result) => Response::success(id, result),
            Err((code, message)) => Response::failure(id, code, message),
        })
    }

    fn add(&mut self, object: FakeObject) -> i64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.objects.insert(handle, object);
        handle
    }

    fn document_of(&self, handle: i64) -> Result<String, (i64, String)> {
        match self.objects.get(&handle) {
            Some(FakeObject::Doc(doc)) => Ok(doc.clone()),
            _ => Err((NOT_FOUND, format!("Handle {handle} is not a document"))),
        }
    }

    fn open_document(&self) -> Option<String> {
        self.objects.values().find_map(|o| match o {
            FakeObject::Doc(doc) => Some(doc.clone()),
            _ => None,
        })
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, request: &Request) -> Result<Value, (i64, String)> {
        let params = &request.params;
        let handle = request.handle;

        match request.method.as_str() {
            methods::ENGINE_VERSION if handle == GLOBAL_HANDLE => {
                Ok(json!({"qVersion": {"qComponentVersion": "fake-engine-1.0"}}))
            }
            methods::OPEN_DOC if handle == GLOBAL_HANDLE => {
                let doc = arg_str(params, 0, "qDocName")
                    .ok_or((NOT_FOUND, "Missing document name".to_string()))?;
                let mut state = self.engine.lock();
                if state.missing_documents.contains(&doc) {
                    return Err((NOT_FOUND, format!("App not found: {doc}")));
                }
                state.documents.entry(doc.clone()).or_default();
                drop(state);
                let h = self.add(FakeObject::Doc(doc.clone()));
                Ok(returned("Doc", h, &doc))
            }
            methods::CREATE_SESSION_OBJECT
            | methods::CREATE_BOOKMARK
            | methods::CREATE_DIMENSION
            | methods::CREATE_MEASURE
            | methods::CREATE_VARIABLE => {
                self.document_of(handle)?;
                let props = arg(params, 0, "qProp").cloned().unwrap_or(Value::Null);
                let generic_id = props
                    .pointer("/qInfo/qId")
                    .and_then(Value::as_str)
                    .map_or_else(|| format!("obj-{}", self.next_handle), ToString::to_string);
                let object = if props.get("qSelectionObjectDef").is_some() {
                    FakeObject::SelectionList {
                        generic_id: generic_id.clone(),
                    }
                } else if props.get("qVariableListDef").is_some() {
                    FakeObject::VariableList {
                        generic_id: generic_id.clone(),
                    }
                } else {
                    FakeObject::Generic {
                        generic_id: generic_id.clone(),
                        props,
                    }
                };
                let h = self.add(object);
                Ok(returned("GenericObject", h, &generic_id))
            }
            methods::DESTROY_SESSION_OBJECT
            | methods::DESTROY_BOOKMARK
            | methods::DESTROY_DIMENSION
            | methods::DESTROY_MEASURE
            | methods::DESTROY_VARIABLE => {
                self.document_of(handle)?;
                let target = arg_str(params, 0, "qId").unwrap_or_default();
                let found = self
                    .objects
                    .iter()
                    .find(|(_, o)| o.generic_id() == Some(target.as_str()))
                    .map(|(h, _)| *h);
                if let Some(h) = found {
                    self.objects.remove(&h);
                }
                Ok(json!({"qSuccess": found.is_some()}))
            }
            methods::GET_PROPERTIES => match self.objects.get(&handle) {
                Some(FakeObject::Generic { props, .. }) => Ok(json!({"qProp": props})),
                Some(_) => Ok(json!({"qProp": {}})),
                None => Err((NOT_FOUND, format!("Unknown handle {handle}"))),
            },
            methods::GET_LAYOUT => self.layout(handle),
            methods::CLEAR_ALL => {
                let doc = self.document_of(handle)?;
                if let Some(d) = self.engine.lock().documents.get_mut(&doc) {
                    d.selections.clear();
                }
                Ok(json!({}))
            }
            methods::GET_FIELD => {
                self.document_of(handle)?;
                let field = arg_str(params, 0, "qFieldName")
                    .ok_or((NOT_FOUND, "Missing field name".to_string()))?;
                let h = self.add(FakeObject::Field(field.clone()));
                Ok(returned("Field", h, &field))
            }
            methods::SELECT_VALUES => {
                let Some(FakeObject::Field(field)) = self.objects.get(&handle).cloned() else {
                    return Err((NOT_FOUND, format!("Handle {handle} is not a field")));
                };
                let values: Vec<Value> = arg(params, 0, "qFieldValues")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .map(|v| v.get("qText").cloned().unwrap_or(Value::Null))
                            .collect()
                    })
                    .unwrap_or_default();
                let doc = self.open_document().unwrap_or_default();
                let mut state = self.engine.lock();
                let selections = &mut state.documents.entry(doc).or_default().selections;
                if values.is_empty() {
                    selections.remove(&field);
                } else {
                    selections.insert(field, values);
                }
                Ok(json!({"qReturn": true}))
            }
            methods::GET_VARIABLE_BY_NAME => {
                let doc = self.document_of(handle)?;
                let name = arg_str(params, 0, "qName")
                    .ok_or((NOT_FOUND, "Missing variable name".to_string()))?;
                let exists = self
                    .engine
                    .lock()
                    .documents
                    .get(&doc)
                    .is_some_and(|d| d.variables.contains_key(&name));
                if !exists {
                    return Err((NOT_FOUND, format!("Variable not found: {name}")));
                }
                let h = self.add(FakeObject::Variable(name.clone()));
                Ok(returned("GenericVariable", h, &name))
            }
            methods::SET_STRING_VALUE => {
                let Some(FakeObject::Variable(name)) = self.objects.get(&handle).cloned() else {
                    return Err((NOT_FOUND, format!("Handle {handle} is not a variable")));
                };
                let value = arg(params, 0, "qVal").cloned().unwrap_or(Value::Null);
                let doc = self.open_document().unwrap_or_default();
                self.engine
                    .lock()
                    .documents
                    .entry(doc)
                    .or_default()
                    .variables
                    .insert(name, value);
                Ok(json!({}))
            }
            other => match self.objects.get(&handle) {
                // Echo unknown methods on generic objects back so callers can
                // exercise arbitrary method invocation.
                Some(FakeObject::Generic { generic_id, .. }) if other.starts_with("Echo") => {
                    Ok(json!({"method": other, "qId": generic_id, "params": params}))
                }
                _ => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
            },
        }
    }

    fn layout(&self, handle: i64) -> Result<Value, (i64, String)> {
        let doc = self.open_document().unwrap_or_default();
        match self.objects.get(&handle) {
            Some(FakeObject::SelectionList { .. }) => {
                let state = self.engine.lock();
                let selections: Vec<Value> = state
                    .documents
                    .get(&doc)
                    .map(|d| {
                        d.selections
                            .iter()
                            .map(|(field, values)| {
                                let info: Vec<Value> =
                                    values.iter().map(|v| json!({"qName": v})).collect();
                                json!({"qField": field, "qSelectedFieldSelectionInfo": info})
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(json!({"qLayout": {"qSelectionObject": {"qSelections": selections}}}))
            }
            Some(FakeObject::VariableList { .. }) => {
                let state = self.engine.lock();
                let items: Vec<Value> = state
                    .documents
                    .get(&doc)
                    .map(|d| {
                        d.variables
                            .iter()
                            .map(|(name, def)| json!({"qName": name, "qDefinition": def}))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(json!({"qLayout": {"qVariableList": {"qItems": items}}}))
            }
            Some(FakeObject::Generic { props, .. }) => Ok(json!({"qLayout": props})),
            Some(_) => Ok(json!({"qLayout": {}})),
            None => Err((NOT_FOUND, format!("Unknown handle {handle}"))),
        }
    }
}
