//! Immutable dispatch table and runtime overload resolution.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, info};

use crate::contract::{ContractDescriptor, MethodSignature, ServiceContract};
use crate::error::{RabbitRpcError, Result};
use crate::types::{Arguments, Returned};

/// Server-side entry point for one method signature
pub type HandlerFn =
    Arc<dyn Fn(Arguments) -> BoxFuture<'static, anyhow::Result<Returned>> + Send + Sync>;

enum HandlerTarget {
    Key(String),
    Index(usize),
}

/// A contract descriptor together with the implementation serving it
pub struct ServiceBinding {
    descriptor: ContractDescriptor,
    handlers: Vec<(HandlerTarget, HandlerFn)>,
}

impl ServiceBinding {
    pub fn new(descriptor: ContractDescriptor) -> Self {
        Self {
            descriptor,
            handlers: Vec::new(),
        }
    }

    /// Serve the signature whose key (`name(type,..)`) is `key`
    pub fn handler<F, Fut>(mut self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Returned>> + Send + 'static,
    {
        self.handlers
            .push((HandlerTarget::Key(key.into()), boxed(handler)));
        self
    }

    /// Serve the `index`-th declared signature
    pub fn handler_at<F, Fut>(mut self, index: usize, handler: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Returned>> + Send + 'static,
    {
        self.handlers.push((HandlerTarget::Index(index), boxed(handler)));
        self
    }

    pub fn descriptor(&self) -> &ContractDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Match handlers to signatures; every signature needs exactly one
    fn into_handlers(self) -> Result<(ContractDescriptor, Vec<HandlerFn>)> {
        let keys: Vec<String> = self.descriptor.methods.iter().map(MethodSignature::key).collect();
        let mut slots: Vec<Option<HandlerFn>> = vec![None; keys.len()];

        for (target, handler) in self.handlers {
            let index = match &target {
                HandlerTarget::Key(key) => keys.iter().position(|k| k == key),
                HandlerTarget::Index(index) => Some(*index).filter(|i| *i < keys.len()),
            }
            .ok_or_else(|| {
                let label = match target {
                    HandlerTarget::Key(key) => key,
                    HandlerTarget::Index(index) => format!("#{}", index),
                };
                RabbitRpcError::config_error(format!(
                    "handler {} does not match any method of {}",
                    label, self.descriptor.name
                ))
            })?;

            if slots[index].replace(handler).is_some() {
                return Err(RabbitRpcError::config_error(format!(
                    "method {}::{} has more than one handler",
                    self.descriptor.name, keys[index]
                )));
            }
        }

        let handlers = slots
            .into_iter()
            .zip(&keys)
            .map(|(slot, key)| {
                slot.ok_or_else(|| {
                    RabbitRpcError::config_error(format!(
                        "method {}::{} has no handler",
                        self.descriptor.name, key
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((self.descriptor, handlers))
    }
}

impl std::fmt::Debug for ServiceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBinding")
            .field("contract", &self.descriptor.name)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

fn boxed<F, Fut>(handler: F) -> HandlerFn
where
    F: Fn(Arguments) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Returned>> + Send + 'static,
{
    Arc::new(move |args| handler(args).boxed())
}

/// A resolvable signature with its handler
#[derive(Clone)]
pub struct DispatchEntry {
    pub signature: MethodSignature,
    pub handler: HandlerFn,
}

/// Everything needed to serve one contract
pub struct ContractEntry {
    pub contract: ServiceContract,
    pub methods: Vec<DispatchEntry>,
}

/// Collects bindings during startup
#[derive(Default)]
pub struct DispatchTableBuilder {
    contracts: HashMap<String, ContractEntry>,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolved contract and the binding serving it
    pub fn add(&mut self, contract: ServiceContract, binding: ServiceBinding) -> Result<()> {
        if self.contracts.contains_key(&contract.name) {
            return Err(RabbitRpcError::config_error(format!(
                "contract {} is registered twice",
                contract.name
            )));
        }

        let (descriptor, handlers) = binding.into_handlers()?;
        let methods = descriptor
            .methods
            .into_iter()
            .zip(handlers)
            .map(|(signature, handler)| DispatchEntry { signature, handler })
            .collect();

        debug!("Dispatch entries compiled for {}", contract.name);
        self.contracts
            .insert(contract.name.clone(), ContractEntry { contract, methods });
        Ok(())
    }

    pub fn build(self) -> DispatchTable {
        let methods: usize = self.contracts.values().map(|c| c.methods.len()).sum();
        info!(
            "Dispatch table ready: {} contracts, {} methods",
            self.contracts.len(),
            methods
        );
        DispatchTable {
            contracts: self.contracts,
        }
    }
}

/// Read-only after startup; shared by every consumer as `Arc<DispatchTable>`
pub struct DispatchTable {
    contracts: HashMap<String, ContractEntry>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::new()
    }

    pub fn contract(&self, service_id: &str) -> Option<&ContractEntry> {
        self.contracts.get(service_id)
    }

    pub fn contracts(&self) -> impl Iterator<Item = &ContractEntry> {
        self.contracts.values()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    /// Pick the signature for a call.
    ///
    /// Candidates share the method name and arity. A candidate matches when
    /// every non-null tag is assignable to its parameter; null matches
    /// anything. Several matches are narrowed by the caller's static
    /// parameter types (`hint`), then by the count of exact tag matches.
    pub fn resolve(
        &self,
        service_id: &str,
        method: &str,
        tags: &[Option<&str>],
        hint: Option<&[String]>,
    ) -> Result<(&ContractEntry, &DispatchEntry)> {
        let entry = self
            .contracts
            .get(service_id)
            .ok_or_else(|| RabbitRpcError::ServiceNotFound {
                service_name: service_id.to_string(),
            })?;

        let matching: Vec<(&DispatchEntry, usize)> = entry
            .methods
            .iter()
            .filter(|candidate| {
                candidate.signature.name == method && candidate.signature.arity() == tags.len()
            })
            .filter_map(|candidate| exact_matches(&candidate.signature, tags).map(|exact| (candidate, exact)))
            .collect();

        let chosen = pick(matching, hint).map_err(|ambiguous| match ambiguous {
            None => RabbitRpcError::MethodNotFound {
                service_name: service_id.to_string(),
                method_name: method.to_string(),
            },
            Some(candidates) => RabbitRpcError::AmbiguousMethod {
                service_name: service_id.to_string(),
                method_name: method.to_string(),
                candidates,
            },
        })?;

        Ok((entry, chosen))
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("contracts", &self.contracts.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Exact tag matches when `signature` accepts `tags`, `None` otherwise
fn exact_matches(signature: &MethodSignature, tags: &[Option<&str>]) -> Option<usize> {
    let mut exact = 0;
    for (param, tag) in signature.params.iter().zip(tags) {
        match tag {
            None => {}
            Some(tag) if param.ty.name == *tag => exact += 1,
            Some(tag) if param.ty.is_assignable_from(tag) => {}
            Some(_) => return None,
        }
    }
    Some(exact)
}

/// `Err(None)` when nothing matched, `Err(Some(keys))` when still ambiguous
fn pick<'a>(
    mut matching: Vec<(&'a DispatchEntry, usize)>,
    hint: Option<&[String]>,
) -> std::result::Result<&'a DispatchEntry, Option<Vec<String>>> {
    if matching.len() <= 1 {
        return matching.pop().map(|(entry, _)| entry).ok_or(None);
    }

    if let Some(hint) = hint {
        let hinted: Vec<_> = matching
            .iter()
            .filter(|(entry, _)| entry.signature.param_types() == hint)
            .collect();
        if let [(entry, _)] = hinted.as_slice() {
            return Ok(*entry);
        }
    }

    let best = matching.iter().map(|(_, exact)| *exact).max().unwrap_or_default();
    matching.retain(|(_, exact)| *exact == best);
    if matching.len() == 1 {
        return matching.pop().map(|(entry, _)| entry).ok_or(None);
    }

    Err(Some(
        matching
            .iter()
            .map(|(entry, _)| entry.signature.key())
            .collect(),
    ))
}
