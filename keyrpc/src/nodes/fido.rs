//! CTAP2 nodes: PIN handling, fingerprint enrollment and resident
//! credential management.
//!
//! Fingerprint and credential children need a PIN token, so they are only
//! reachable after `verify_pin` succeeded on the [`Ctap2Node`].

use super::object;
use async_trait::async_trait;
use device::fido::{FidoCredential, PinPermissions, RelyingParty};
use device::{BioEnrollment, CredentialManagement, Ctap2Session, DeviceError};
use protocol::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const VERIFY_RP_ID: &str = "keyrpc.example.com";

pub struct Ctap2Node {
    session: Arc<dyn Ctap2Session>,
    pin: Option<String>,
}

impl Ctap2Node {
    pub fn new(session: Arc<dyn Ctap2Session>) -> Self {
        Self { session, pin: None }
    }

    fn verified_pin(&self) -> RpcResult<&str> {
        self.pin
            .as_deref()
            .ok_or_else(|| RpcError::invalid_params("PIN not verified"))
    }

    async fn reset(&mut self, ctx: &CallContext) -> RpcResult<Body> {
        ctx.signal("reset", object(json!({ "state": "touch" })));
        self.session.reset(&ctx.cancel).await?;
        self.pin = None;
        info!("FIDO application reset");
        Err(RpcError::ChildReset("FIDO application reset".to_string()))
    }

    async fn set_pin(&mut self, mut params: Params) -> RpcResult<Body> {
        let new_pin = params.required_str("new_pin")?;
        if self.session.get_info().await?.has_pin() {
            let pin = params.required_str("pin")?;
            self.session.change_pin(&pin, &new_pin).await?;
        } else {
            self.session.set_pin(&new_pin).await?;
        }
        Ok(Body::new())
    }
}

#[async_trait]
impl Node for Ctap2Node {
    async fn data(&mut self) -> RpcResult<Body> {
        Ok(self.session.get_info().await?.0)
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(vec![
            ActionSpec::new("reset"),
            ActionSpec::new("verify_pin"),
            ActionSpec::new("set_pin"),
        ])
    }

    async fn children(&mut self) -> RpcResult<Children> {
        let info = self.session.get_info().await?;
        let mut children = Children::new();
        if info.option("bioEnroll").is_some() {
            children.insert("fingerprints".to_string(), Value::Object(Body::new()));
        }
        if info.option("credMgmt") == Some(true) {
            children.insert("credentials".to_string(), Value::Object(Body::new()));
        }
        Ok(children)
    }

    async fn invoke(&mut self, action: &str, mut params: Params, ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "reset" => self.reset(ctx).await,
            "verify_pin" => {
                let pin = params.required_str("pin")?;
                self.session
                    .get_pin_token(&pin, PinPermissions::GET_ASSERTION, Some(VERIFY_RP_ID))
                    .await?;
                self.pin = Some(pin);
                Ok(Body::new())
            }
            "set_pin" => self.set_pin(params).await,
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        match name {
            "fingerprints" => {
                let token = self
                    .session
                    .get_pin_token(self.verified_pin()?, PinPermissions::BIO_ENROLL, None)
                    .await?;
                let bio = self.session.bio_enrollment(token).await?;
                Ok(Box::new(FingerprintsNode::new(bio).await?))
            }
            "credentials" => {
                let token = self
                    .session
                    .get_pin_token(self.verified_pin()?, PinPermissions::CREDENTIAL_MGMT, None)
                    .await?;
                let credman = self.session.credential_management(token).await?;
                Ok(Box::new(CredentialsRpsNode::new(credman).await?))
            }
            other => Err(RpcError::NoSuchNode(other.to_string())),
        }
    }
}

/// Enrolled templates, shared by the fingerprints node and its open child.
struct Templates {
    bio: Arc<dyn BioEnrollment>,
    by_id: Mutex<BTreeMap<Vec<u8>, Option<String>>>,
}

impl Templates {
    async fn refresh(&self) -> RpcResult<()> {
        let templates = self.bio.enumerate_enrollments().await?;
        *self.by_id.lock().await = templates;
        Ok(())
    }
}

pub struct FingerprintsNode {
    templates: Arc<Templates>,
}

impl FingerprintsNode {
    async fn new(bio: Arc<dyn BioEnrollment>) -> RpcResult<Self> {
        let templates = Arc::new(Templates {
            bio,
            by_id: Mutex::new(BTreeMap::new()),
        });
        templates.refresh().await?;
        Ok(Self { templates })
    }

    async fn add(&mut self, mut params: Params, ctx: &CallContext) -> RpcResult<Body> {
        let name = params.optional_str("name")?.filter(|n| !n.is_empty());
        let bio = &self.templates.bio;
        let mut enroller = bio.enroll().await?;

        let template_id = loop {
            ctx.check_cancelled()?;
            ctx.signal("capture", object(json!({ "remaining": enroller.remaining() })));
            match enroller.capture(&ctx.cancel).await {
                Ok(Some(template_id)) => break template_id,
                Ok(None) => {}
                Err(DeviceError::Capture(code)) => {
                    debug!(code, "fingerprint capture failed");
                    ctx.signal("capture-error", object(json!({ "code": code })));
                }
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(name) = &name {
            bio.set_name(&template_id, name).await?;
        }
        self.templates
            .by_id
            .lock()
            .await
            .insert(template_id.clone(), name.clone());
        Ok(object(json!({
            "template_id": hex::encode(template_id),
            "name": name,
        })))
    }
}

#[async_trait]
impl Node for FingerprintsNode {
    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(vec![ActionSpec::new("add")])
    }

    async fn children(&mut self) -> RpcResult<Children> {
        let templates = self.templates.by_id.lock().await;
        Ok(templates
            .iter()
            .map(|(id, name)| (hex::encode(id), json!({ "name": name })))
            .collect())
    }

    async fn invoke(&mut self, action: &str, params: Params, ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "add" => self.add(params, ctx).await,
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        let no_such_node = || RpcError::NoSuchNode(name.to_string());
        let template_id = hex::decode(name).map_err(|_| no_such_node())?;
        let label = self
            .templates
            .by_id
            .lock()
            .await
            .get(&template_id)
            .cloned()
            .ok_or_else(no_such_node)?;
        Ok(Box::new(FingerprintNode {
            templates: self.templates.clone(),
            template_id,
            name: label,
        }))
    }
}

pub struct FingerprintNode {
    templates: Arc<Templates>,
    template_id: Vec<u8>,
    name: Option<String>,
}

#[async_trait]
impl Node for FingerprintNode {
    async fn data(&mut self) -> RpcResult<Body> {
        Ok(object(json!({
            "template_id": hex::encode(&self.template_id),
            "name": self.name,
        })))
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(vec![ActionSpec::new("rename"), ActionSpec::new("delete")])
    }

    async fn invoke(&mut self, action: &str, mut params: Params, _ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "rename" => {
                let name = params.required_str("name")?;
                self.templates.bio.set_name(&self.template_id, &name).await?;
                self.name = Some(name);
                self.templates.refresh().await?;
                Ok(Body::new())
            }
            "delete" => {
                self.templates
                    .bio
                    .remove_enrollment(&self.template_id)
                    .await?;
                self.templates.refresh().await?;
                Ok(Body::new())
            }
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }
}

/// Relying parties with resident credentials, keyed by rp id.
struct RelyingParties {
    credman: Arc<dyn CredentialManagement>,
    by_id: Mutex<BTreeMap<String, RelyingParty>>,
}

impl RelyingParties {
    async fn refresh(&self) -> RpcResult<()> {
        let metadata = self.credman.get_metadata().await?;
        let rps = if metadata.existing_cred_count == 0 {
            BTreeMap::new()
        } else {
            self.credman
                .enumerate_rps()
                .await?
                .into_iter()
                .map(|rp| (rp.rp_id.clone(), rp))
                .collect()
        };
        *self.by_id.lock().await = rps;
        Ok(())
    }
}

pub struct CredentialsRpsNode {
    rps: Arc<RelyingParties>,
}

impl CredentialsRpsNode {
    async fn new(credman: Arc<dyn CredentialManagement>) -> RpcResult<Self> {
        let rps = Arc::new(RelyingParties {
            credman,
            by_id: Mutex::new(BTreeMap::new()),
        });
        rps.refresh().await?;
        Ok(Self { rps })
    }
}

#[async_trait]
impl Node for CredentialsRpsNode {
    async fn children(&mut self) -> RpcResult<Children> {
        let rps = self.rps.by_id.lock().await;
        let mut children = Children::new();
        for (id, rp) in rps.iter() {
            children.insert(id.clone(), serde_json::to_value(rp)?);
        }
        Ok(children)
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        let rp = self
            .rps
            .by_id
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::NoSuchNode(name.to_string()))?;
        Ok(Box::new(CredentialsRpNode::new(self.rps.clone(), rp).await?))
    }
}

/// Credentials of one relying party, keyed by hex credential id.
struct RpCredentials {
    rps: Arc<RelyingParties>,
    rp: RelyingParty,
    by_id: Mutex<BTreeMap<String, FidoCredential>>,
}

impl RpCredentials {
    async fn refresh(&self) -> RpcResult<()> {
        self.rps.refresh().await?;
        let credentials = self
            .rps
            .credman
            .enumerate_creds(&self.rp.rp_id_hash)
            .await?
            .into_iter()
            .map(|c| (hex::encode(&c.credential_id), c))
            .collect();
        *self.by_id.lock().await = credentials;
        Ok(())
    }
}

pub struct CredentialsRpNode {
    credentials: Arc<RpCredentials>,
}

impl CredentialsRpNode {
    async fn new(rps: Arc<RelyingParties>, rp: RelyingParty) -> RpcResult<Self> {
        let credentials = Arc::new(RpCredentials {
            rps,
            rp,
            by_id: Mutex::new(BTreeMap::new()),
        });
        credentials.refresh().await?;
        Ok(Self { credentials })
    }
}

#[async_trait]
impl Node for CredentialsRpNode {
    async fn data(&mut self) -> RpcResult<Body> {
        to_body(&self.credentials.rp)
    }

    async fn children(&mut self) -> RpcResult<Children> {
        let credentials = self.credentials.by_id.lock().await;
        let mut children = Children::new();
        for (id, credential) in credentials.iter() {
            children.insert(id.clone(), serde_json::to_value(credential)?);
        }
        Ok(children)
    }

    async fn create_child(&mut self, name: &str) -> RpcResult<Box<dyn Node>> {
        let credential = self
            .credentials
            .by_id
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::NoSuchNode(name.to_string()))?;
        Ok(Box::new(FidoCredentialNode {
            credentials: self.credentials.clone(),
            credential,
        }))
    }
}

pub struct FidoCredentialNode {
    credentials: Arc<RpCredentials>,
    credential: FidoCredential,
}

#[async_trait]
impl Node for FidoCredentialNode {
    async fn data(&mut self) -> RpcResult<Body> {
        to_body(&self.credential)
    }

    async fn actions(&mut self) -> RpcResult<Vec<ActionSpec>> {
        Ok(vec![ActionSpec::new("delete")])
    }

    async fn invoke(&mut self, action: &str, _params: Params, _ctx: &CallContext) -> RpcResult<Body> {
        match action {
            "delete" => {
                self.credentials
                    .rps
                    .credman
                    .delete_cred(&self.credential.credential_id)
                    .await?;
                self.credentials.refresh().await?;
                Ok(Body::new())
            }
            other => Err(RpcError::NoSuchAction(other.to_string())),
        }
    }
}
