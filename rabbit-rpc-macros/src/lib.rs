//! # rabbit-rpc macros
//!
//! `#[rpc_interface]` turns a service trait into everything the runtime needs
//! to serve it and to call it:
//!
//! ```rust,ignore
//! use rabbit_rpc::rpc_interface;
//!
//! #[rpc_interface(exchange = "users-x", queue = "users-q", routing = "users", concurrency = "2-8")]
//! pub trait UserService {
//!     async fn get_user(&self, #[not_null] id: Option<i64>) -> anyhow::Result<User>;
//!
//!     #[rpc(name = "rename")]
//!     async fn rename_by_id(&self, id: i64, #[not_blank] name: String) -> anyhow::Result<()>;
//!
//!     #[fire_and_forget]
//!     async fn touch(&self, id: i64) -> anyhow::Result<()>;
//! }
//! ```
//!
//! generates:
//! - `UserServiceContract`, implementing `rabbit_rpc::RpcInterface`, with
//!   `UserServiceContract::binding(Arc<impl UserService>)` for the server side
//! - `UserServiceClient`, which implements `UserService` by calling the remote service
//!
//! Method attributes:
//! - `#[rpc(name = "...")]` sets the wire method name; several trait methods may
//!   share one to declare overloads
//! - `#[fire_and_forget]` publishes without waiting; the method must return `Result<(), _>`
//!
//! Parameter attributes: `#[not_null]`, `#[not_blank]`, `#[min(n)]`, `#[max(n)]`,
//! `#[size(min = a, max = b)]`, `#[valid]`.
//!
//! Every string argument of `#[rpc_interface]` may use `${key}` / `${key:default}`
//! templates, resolved once at startup. `executor`, `serializer` and
//! `error_handler` name resources registered with the runtime (`@name` or `name`).

extern crate proc_macro;

mod interface;

use proc_macro::TokenStream;

/// Declares a service contract from a trait.
///
/// Required keys: `exchange`, `queue`, `routing`. Optional: `name` (defaults to
/// the trait name), `concurrency` (`"n"` or `"min-max"`), `executor`,
/// `serializer`, `error_handler`, `reply_timeout_ms`, `durable`, and any
/// number of `allow = "pattern"` allow-list entries.
#[proc_macro_attribute]
pub fn rpc_interface(args: TokenStream, input: TokenStream) -> TokenStream {
    interface::impl_rpc_interface(args, input)
}
