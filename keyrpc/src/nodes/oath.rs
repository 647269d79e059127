use super::object;
use async_trait::async_trait;
use device::oath::{Credential, CredentialData, HashAlgorithm, OathType};
use device::OathSession;
use protocol::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Credentials by id, shared between the accounts node and an open credential.
type CredentialCache = Arc<Mutex<BTreeMap<String, Credential>>>;

pub struct OathNode {
    session: Arc<dyn OathSession>,
}

impl OathNode {
    pub fn new(session: Arc<dyn OathSession>) -> Self {
        Self { session }
    }

    /// Reads `password` (derived against the session salt) or a raw hex `key`.
    fn access_key(&self, params: &mut Params) -> RpcResult<Vec<u8>> {
        match params.optional_str("password")? {
            Some(password) => Ok(self.session.derive_key(&password)),
            None => params.required_hex("key"),
        }
    }
}

#[async_trait]
impl Node for OathNode {
    async fn data(&mut self) -> RpcResult<Body> {
        Ok(object(json!({
            "version": self.session.version(),
            "device_id": self.session.device_id(),
            "locked": self.session.locked().await?,
            "has_key": self.session.has_key().await?,
        })))
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(vec![
            ActionSpec::new("derive"),
            ActionSpec::new("validate"),
            ActionSpec::new("set_key"),
            ActionSpec::new("unset_key"),
            ActionSpec::new("reset"),
            ActionSpec::new("calculate"),
        ])
    }

    async fn children(&mut self) -> RpcResult<Children> {
        Ok(object(json!({ "accounts": {} })))
    }

    async fn invoke(&mut self, action: &str, mut params: Params, _ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "derive" => {
                let password = params.required_str("password")?;
                let key = self.session.derive_key(&password);
                Ok(object(json!({ "key": hex::encode(key) })))
            }
            "validate" => {
                let key = self.access_key(&mut params)?;
                self.session.validate(&key).await?;
                Ok(Body::new())
            }
            "set_key" => {
                let key = self.access_key(&mut params)?;
                self.session.set_key(&key).await?;
                Ok(Body::new())
            }
            "unset_key" => {
                self.session.unset_key().await?;
                Ok(Body::new())
            }
            "reset" => {
                self.session.reset().await?;
                info!("OATH application reset");
                Err(RpcError::ChildReset("OATH application reset".to_string()))
            }
            "calculate" => {
                let credential_id = params.required_hex("credential")?;
                let challenge = params.required_hex("challenge")?;
                let response = self.session.calculate(&credential_id, &challenge).await?;
                Ok(object(json!({ "response": hex::encode(response) })))
            }
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        match name {
            "accounts" => Ok(Box::new(OathCredentialsNode::new(self.session.clone()).await?)),
            other => Err(RpcError::NoSuchNode(other.to_string())),
        }
    }
}

pub struct OathCredentialsNode {
    session: Arc<dyn OathSession>,
    credentials: CredentialCache,
}

impl OathCredentialsNode {
    pub async fn new(session: Arc<dyn OathSession>) -> RpcResult<Self> {
        let credentials = session
            .list_credentials()
            .await?
            .into_iter()
            .map(|c| (c.id_string(), c))
            .collect();
        Ok(Self {
            session,
            credentials: Arc::new(Mutex::new(credentials)),
        })
    }

    async fn put_credential(&self, data: CredentialData, require_touch: bool) -> RpcResult<Body> {
        let id = String::from_utf8_lossy(&data.id()).into_owned();
        let mut credentials = self.credentials.lock().await;
        if credentials.contains_key(&id) {
            return Err(RpcError::Exception("Credential already exists".to_string()));
        }
        let credential = self.session.put_credential(&data, require_touch).await?;
        let body = to_body(&credential)?;
        credentials.insert(credential.id_string(), credential);
        Ok(body)
    }
}

/// Builds credential data from `put_data` params. Unrecognised keys are ignored.
fn credential_data(params: &mut Params) -> RpcResult<CredentialData> {
    let name = params.required_str("name")?;
    let oath_type: OathType = params.required_str("oath_type")?.parse()?;
    let hash: HashAlgorithm = match params.optional_str("hash")? {
        Some(hash) => hash.parse()?,
        None => HashAlgorithm::Sha1,
    };
    let secret = params.required_hex("secret")?;

    let mut data = CredentialData::new(name, oath_type, secret).with_hash(hash);
    if let Some(digits) = params.optional_as::<u8>("digits")? {
        data = data.with_digits(digits);
    }
    if let Some(period) = params.optional_as::<u32>("period")? {
        data = data.with_period(period);
    }
    if let Some(counter) = params.optional_as::<u32>("counter")? {
        data = data.with_counter(counter);
    }
    if let Some(issuer) = params.optional_str("issuer")? {
        data = data.with_issuer(issuer);
    }
    Ok(data)
}

#[async_trait]
impl Node for OathCredentialsNode {
    async fn data(&mut self) -> RpcResult<Body> {
        let credentials = self.credentials.lock().await;
        let mut list: Vec<&Credential> = credentials.values().collect();
        list.sort_by_key(|c| c.sort_key());
        Ok(object(json!({ "credentials": list })))
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(vec![
            ActionSpec::new("delete"),
            ActionSpec::new("put_data"),
            ActionSpec::new("put_uri"),
            ActionSpec::new("calculate_all"),
        ])
    }

    async fn children(&mut self) -> RpcResult<Children> {
        let credentials = self.credentials.lock().await;
        let mut children = Children::new();
        for (id, credential) in credentials.iter() {
            children.insert(
                id.clone(),
                json!({
                    "name": credential.name,
                    "issuer": credential.issuer,
                    "oath_type": credential.oath_type,
                }),
            );
        }
        Ok(children)
    }

    async fn invoke(&mut self, action: &str, mut params: Params, _ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "delete" => {
                let id = params.required_str("credential")?;
                self.session.delete_credential(id.as_bytes()).await?;
                self.credentials.lock().await.remove(&id);
                Ok(Body::new())
            }
            "put_data" => {
                let require_touch = params.optional_bool("require_touch")?.unwrap_or(false);
                let data = credential_data(&mut params)?;
                self.put_credential(data, require_touch).await
            }
            "put_uri" => {
                let require_touch = params.optional_bool("require_touch")?.unwrap_or(false);
                let uri = params.required_str("uri")?;
                let data = CredentialData::parse_uri(&uri)?;
                self.put_credential(data, require_touch).await
            }
            "calculate_all" => {
                let timestamp = params.optional_u64("timestamp")?;
                let entries: Vec<Value> = self
                    .session
                    .calculate_all(timestamp)
                    .await?
                    .into_iter()
                    .map(|(credential, code)| json!({ "credential": credential, "code": code }))
                    .collect();
                Ok(object(json!({ "entries": entries })))
            }
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        let credential = self
            .credentials
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::NoSuchNode(name.to_string()))?;
        Ok(Box::new(OathCredentialNode {
            session: self.session.clone(),
            credential,
            credentials: self.credentials.clone(),
        }))
    }
}

pub struct OathCredentialNode {
    session: Arc<dyn OathSession>,
    credential: Credential,
    credentials: CredentialCache,
}

#[async_trait]
impl Node for OathCredentialNode {
    async fn data(&mut self) -> RpcResult<Body> {
        to_body(&self.credential)
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(vec![
            ActionSpec::new("code"),
            ActionSpec::new("calculate"),
            ActionSpec::new("delete"),
            ActionSpec::new("rename"),
        ])
    }

    async fn invoke(&mut self, action: &str, mut params: Params, _ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "code" => {
                let timestamp = params.optional_u64("timestamp")?;
                let code = self.session.calculate_code(&self.credential, timestamp).await?;
                to_body(&code)
            }
            "calculate" => {
                let challenge = params.required_hex("challenge")?;
                let response = self.session.calculate(&self.credential.id, &challenge).await?;
                Ok(object(json!({ "response": hex::encode(response) })))
            }
            "delete" => {
                self.session.delete_credential(&self.credential.id).await?;
                self.credentials
                    .lock()
                    .await
                    .remove(&self.credential.id_string());
                Ok(Body::new())
            }
            "rename" => {
                let name = params.required_str("name")?;
                let issuer = params.optional_str("issuer")?;
                let new_id = self
                    .session
                    .rename_credential(&self.credential.id, &name, issuer.as_deref())
                    .await?;
                let renamed = Credential::from_id(
                    &self.credential.device_id,
                    new_id,
                    self.credential.oath_type,
                    self.credential.touch_required,
                );

                let mut credentials = self.credentials.lock().await;
                credentials.remove(&self.credential.id_string());
                credentials.insert(renamed.id_string(), renamed.clone());
                self.credential = renamed;
                to_body(&self.credential)
            }
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }
}
