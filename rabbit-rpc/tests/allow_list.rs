mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rabbit_rpc::{async_trait, rpc_interface, rpc_type, AllowListStrategy, MemoryBroker, RabbitRpcError, RpcRuntime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub secret: String,
}

rpc_type!(Token => "secret.Token");

#[rpc_interface(exchange = "vault-x", queue = "vault-q", routing = "vault")]
pub trait Vault {
    async fn store(&self, token: Token) -> anyhow::Result<bool>;
}

#[rpc_interface(name = "Vault", exchange = "vault-x", queue = "vault-q", routing = "vault", allow = "secret.*")]
pub trait TrustedVault {
    async fn store(&self, token: Token) -> anyhow::Result<bool>;
}

#[derive(Default)]
struct Safe {
    stored: AtomicUsize,
}

#[async_trait]
impl Vault for Safe {
    async fn store(&self, _token: Token) -> anyhow::Result<bool> {
        self.stored.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[async_trait]
impl TrustedVault for Safe {
    async fn store(&self, _token: Token) -> anyhow::Result<bool> {
        self.stored.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

fn token() -> Token {
    Token {
        secret: "s3cr3t".to_string(),
    }
}

fn rpc_error(err: &anyhow::Error) -> &RabbitRpcError {
    err.downcast_ref::<RabbitRpcError>()
        .unwrap_or_else(|| panic!("not an rpc error: {:#}", err))
}

#[tokio::test]
async fn callers_refuse_to_send_types_outside_the_allow_list() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = RpcRuntime::builder(broker.clone(), common::settings("vault"))
        .client::<VaultContract>()
        .start()
        .await
        .unwrap();
    let vault = runtime.client::<VaultContract>().unwrap();

    let err = vault.store(token()).await.unwrap_err();
    assert!(matches!(rpc_error(&err), RabbitRpcError::Serialization(_)));
    assert_eq!(broker.published_count(), 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn servers_reject_tags_outside_their_allow_list() {
    let broker = Arc::new(MemoryBroker::new());
    let safe = Arc::new(Safe::default());

    let server = RpcRuntime::builder(broker.clone(), common::settings("vault"))
        .serve(VaultContract::binding(safe.clone()))
        .start()
        .await
        .unwrap();
    let caller = RpcRuntime::builder(broker.clone(), common::settings("caller"))
        .client::<TrustedVaultContract>()
        .start()
        .await
        .unwrap();
    let vault = caller.client::<TrustedVaultContract>().unwrap();

    let err = vault.store(token()).await.unwrap_err();
    assert!(matches!(
        rpc_error(&err),
        RabbitRpcError::RemoteService { status_code: 500, .. }
    ));
    assert_eq!(safe.stored.load(Ordering::SeqCst), 0);

    caller.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn contract_patterns_extend_the_allow_list() {
    let broker = Arc::new(MemoryBroker::new());
    let safe = Arc::new(Safe::default());

    let runtime = RpcRuntime::builder(broker.clone(), common::settings("vault"))
        .serve(TrustedVaultContract::binding(safe.clone()))
        .client::<TrustedVaultContract>()
        .start()
        .await
        .unwrap();
    let vault = runtime.client::<TrustedVaultContract>().unwrap();

    assert!(vault.store(token()).await.unwrap());
    assert_eq!(safe.stored.load(Ordering::SeqCst), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn contract_types_are_registered_with_their_own_serializer() {
    let broker = Arc::new(MemoryBroker::new());
    let safe = Arc::new(Safe::default());
    let mut settings = common::settings("vault");
    settings.allow_list_strategy = AllowListStrategy::Registration;

    let runtime = RpcRuntime::builder(broker.clone(), settings)
        .serve(TrustedVaultContract::binding(safe.clone()))
        .client::<TrustedVaultContract>()
        .start()
        .await
        .unwrap();
    let vault = runtime.client::<TrustedVaultContract>().unwrap();

    assert!(vault.store(token()).await.unwrap());
    assert_eq!(safe.stored.load(Ordering::SeqCst), 1);

    runtime.shutdown().await;
}
