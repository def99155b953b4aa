//! A contract and client written without `#[rpc_interface]`.

mod common;

use std::sync::Arc;

use rabbit_rpc::{
    Arguments, CallArgs, ClientInvoker, ContractDeclaration, ContractDescriptor, MemoryBroker, MethodSignature,
    RabbitRpcError, Result, Returned, RpcInterface, RpcRuntime, ServiceBinding,
};

struct Calc;

struct CalcClient {
    invoker: ClientInvoker,
}

impl CalcClient {
    async fn add(&self, a: i32, b: i32) -> Result<i32> {
        self.invoker.call("add", CallArgs::new().arg(a).arg(b)).await
    }

    async fn add_wide(&self, a: i64, b: i64) -> Result<i64> {
        self.invoker.call("add", CallArgs::new().arg(a).arg(b)).await
    }

    async fn describe_text(&self, text: Option<String>) -> Result<String> {
        self.invoker.call("describe", CallArgs::new().arg(text)).await
    }

    async fn describe_number(&self, number: Option<i32>) -> Result<String> {
        self.invoker.call("describe", CallArgs::new().arg(number)).await
    }
}

impl RpcInterface for Calc {
    type Client = CalcClient;

    fn descriptor() -> ContractDescriptor {
        ContractDescriptor::new("calc", ContractDeclaration::new("calc-x", "calc-q", "calc"))
            .method(MethodSignature::new("add").param::<i32>("a").param::<i32>("b").returns::<i32>())
            .method(MethodSignature::new("add").param::<i64>("a").param::<i64>("b").returns::<i64>())
            .method(MethodSignature::new("describe").param::<Option<String>>("text").returns::<String>())
            .method(MethodSignature::new("describe").param::<Option<i32>>("number").returns::<String>())
    }

    fn client(invoker: ClientInvoker) -> CalcClient {
        CalcClient { invoker }
    }
}

fn binding() -> ServiceBinding {
    ServiceBinding::new(Calc::descriptor())
        .handler("add(std.i32,std.i32)", |mut args: Arguments| async move {
            let (a, b) = (args.take::<i32>(0)?, args.take::<i32>(1)?);
            Ok::<_, anyhow::Error>(Returned::value(a + b))
        })
        .handler("add(std.i64,std.i64)", |mut args: Arguments| async move {
            let (a, b) = (args.take::<i64>(0)?, args.take::<i64>(1)?);
            Ok::<_, anyhow::Error>(Returned::value(a * 1_000 + b))
        })
        .handler_at(2, |mut args: Arguments| async move {
            let text = args.take::<Option<String>>(0)?;
            Ok::<_, anyhow::Error>(Returned::value(format!("text {:?}", text)))
        })
        .handler_at(3, |mut args: Arguments| async move {
            let number = args.take::<Option<i32>>(0)?;
            Ok::<_, anyhow::Error>(Returned::value(format!("number {:?}", number)))
        })
}

async fn start(broker: &Arc<MemoryBroker>) -> RpcRuntime {
    RpcRuntime::builder(broker.clone(), common::settings("calc"))
        .serve(binding())
        .client::<Calc>()
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn static_types_select_among_overloads() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = start(&broker).await;
    let calc = runtime.client::<Calc>().unwrap();

    assert_eq!(calc.add(2, 3).await.unwrap(), 5);
    assert_eq!(calc.add_wide(2, 3).await.unwrap(), 2_003);

    runtime.shutdown().await;
}

#[tokio::test]
async fn null_arguments_are_narrowed_by_the_declared_types() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = start(&broker).await;
    let calc = runtime.client::<Calc>().unwrap();

    assert_eq!(calc.describe_text(None).await.unwrap(), "text None");
    assert_eq!(calc.describe_number(None).await.unwrap(), "number None");
    assert_eq!(calc.describe_number(Some(4)).await.unwrap(), "number Some(4)");

    runtime.shutdown().await;
}

#[tokio::test]
async fn calls_matching_no_signature_fail_locally() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = start(&broker).await;
    let invoker = runtime.invoker("calc").unwrap();
    let published = broker.published_count();

    let mixed = invoker.call::<i64>("add", CallArgs::new().arg(1i32).arg(2i64)).await;
    assert!(matches!(mixed, Err(RabbitRpcError::MethodNotFound { .. })));
    let missing = invoker.call::<i64>("subtract", CallArgs::new().arg(1i32).arg(2i32)).await;
    assert!(matches!(missing, Err(RabbitRpcError::MethodNotFound { .. })));
    assert_eq!(broker.published_count(), published);

    runtime.shutdown().await;
}

#[tokio::test]
async fn every_signature_needs_a_handler() {
    let broker = Arc::new(MemoryBroker::new());
    let partial = ServiceBinding::new(Calc::descriptor()).handler("add(std.i32,std.i32)", |_args: Arguments| async {
        Ok::<_, anyhow::Error>(Returned::Void)
    });

    let result = RpcRuntime::builder(broker.clone(), common::settings("calc"))
        .serve(partial)
        .start()
        .await;
    assert!(matches!(result, Err(RabbitRpcError::Config(_))));
}
