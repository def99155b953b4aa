mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{User, UserNotFound, UserService, UserServiceContract, Users};
use rabbit_rpc::{AllowListStrategy, ErrorMapping, MemoryBroker, RabbitRpcError, RpcRuntime, StatusCode};

async fn start(broker: &Arc<MemoryBroker>, users: Arc<Users>) -> RpcRuntime {
    RpcRuntime::builder(broker.clone(), common::settings("users"))
        .error_mapping(ErrorMapping::new().map::<UserNotFound>(StatusCode::NOT_FOUND))
        .serve(UserServiceContract::binding(users))
        .client::<UserServiceContract>()
        .start()
        .await
        .unwrap()
}

fn rpc_error(err: &anyhow::Error) -> &RabbitRpcError {
    err.downcast_ref::<RabbitRpcError>()
        .unwrap_or_else(|| panic!("not an rpc error: {:#}", err))
}

#[tokio::test]
async fn values_come_back_typed() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = start(&broker, common::users()).await;
    let client = runtime.client::<UserServiceContract>().unwrap();

    let user = client.get_user(Some(7)).await.unwrap();
    assert_eq!(
        user,
        User {
            id: 7,
            name: "user-7".to_string()
        }
    );

    assert_eq!(client.find_user("nobody".to_string()).await.unwrap(), None);
    assert_eq!(
        client.find_user("ada".to_string()).await.unwrap().map(|user| user.name),
        Some("ada".to_string())
    );
    assert_eq!(runtime.reply_router().unwrap().pending_count(), 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn void_calls_wait_for_completion() {
    let broker = Arc::new(MemoryBroker::new());
    let users = common::users();
    let runtime = start(&broker, users.clone()).await;
    let client = runtime.client::<UserServiceContract>().unwrap();

    client.rename(3, "grace".to_string()).await.unwrap();
    assert_eq!(*users.renamed.lock(), vec![(3, "grace".to_string())]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn overloads_follow_argument_order() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = start(&broker, common::users()).await;
    let client = runtime.client::<UserServiceContract>().unwrap();

    assert_eq!(
        client.process_text("text".to_string(), 5).await.unwrap(),
        "text:textx5"
    );
    assert_eq!(
        client.process_count(5, "text".to_string()).await.unwrap(),
        "count:5xtext"
    );

    runtime.shutdown().await;
}

#[tokio::test]
async fn null_arguments_fail_validation_with_the_field_name() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = start(&broker, common::users()).await;
    let client = runtime.client::<UserServiceContract>().unwrap();

    let err = client.get_user(None).await.unwrap_err();
    match rpc_error(&err) {
        RabbitRpcError::Validation {
            status_code,
            service_name,
            binding_result,
            ..
        } => {
            assert_eq!(*status_code, 400);
            assert_eq!(service_name, "users");
            assert_eq!(binding_result.get("id").map(String::as_str), Some("must not be null"));
        }
        other => panic!("expected a validation error, got {:?}", other),
    }

    let err = client.rename(1, "   ".to_string()).await.unwrap_err();
    assert!(matches!(
        rpc_error(&err),
        RabbitRpcError::Validation { binding_result, .. } if binding_result.contains_key("name")
    ));

    runtime.shutdown().await;
}

#[tokio::test]
async fn mapped_errors_keep_their_status() {
    let broker = Arc::new(MemoryBroker::new());
    let runtime = start(&broker, common::users()).await;
    let client = runtime.client::<UserServiceContract>().unwrap();

    let err = client.get_user(Some(404)).await.unwrap_err();
    match rpc_error(&err) {
        RabbitRpcError::RemoteService {
            status_code,
            message,
            service_name,
            ..
        } => {
            assert_eq!(*status_code, 404);
            assert_eq!(message, "user 404 not found");
            assert_eq!(service_name, "users");
        }
        other => panic!("expected a remote error, got {:?}", other),
    }

    let err = client.get_user(Some(500)).await.unwrap_err();
    match rpc_error(&err) {
        RabbitRpcError::RemoteService {
            status_code, message, ..
        } => {
            assert_eq!(*status_code, 500);
            assert_eq!(message, "Internal server error");
        }
        other => panic!("expected a remote error, got {:?}", other),
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn fire_and_forget_never_replies() {
    let broker = Arc::new(MemoryBroker::new());
    let users = common::users();
    let runtime = start(&broker, users.clone()).await;
    let client = runtime.client::<UserServiceContract>().unwrap();

    client.touch(9).await.unwrap();
    // A failing handler is just as silent
    client.touch(-1).await.unwrap();

    assert!(common::eventually(|| users.touched.lock().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*users.touched.lock(), vec![9, -1]);
    assert_eq!(broker.published_count(), 2);
    assert_eq!(runtime.reply_router().unwrap().pending_count(), 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn calls_without_a_server_time_out() {
    let broker = Arc::new(MemoryBroker::new());
    let mut settings = common::settings("lonely");
    settings.reply_timeout_ms = 150;

    let runtime = RpcRuntime::builder(broker.clone(), settings)
        .client::<UserServiceContract>()
        .start()
        .await
        .unwrap();
    let client = runtime.client::<UserServiceContract>().unwrap();

    let err = client.get_user(Some(1)).await.unwrap_err();
    assert!(matches!(rpc_error(&err), RabbitRpcError::Timeout { timeout_ms: 150 }));
    assert_eq!(runtime.reply_router().unwrap().pending_count(), 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn registration_strategy_registers_declared_types() {
    let broker = Arc::new(MemoryBroker::new());
    let mut settings = common::settings("users");
    settings.allow_list_strategy = AllowListStrategy::Registration;

    let runtime = RpcRuntime::builder(broker.clone(), settings)
        .serve(UserServiceContract::binding(common::users()))
        .client::<UserServiceContract>()
        .start()
        .await
        .unwrap();
    let client = runtime.client::<UserServiceContract>().unwrap();

    assert_eq!(client.get_user(Some(7)).await.unwrap().name, "user-7");
    assert_eq!(
        client.find_user("ada".to_string()).await.unwrap().map(|user| user.id),
        Some(1)
    );

    runtime.shutdown().await;
}
