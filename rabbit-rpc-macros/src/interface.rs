use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{
    parse_macro_input, parse_quote, Attribute, Expr, ExprLit, FnArg, GenericArgument, Ident, ItemTrait, Lit,
    LitInt, LitStr, MetaNameValue, Pat, PathArguments, ReturnType, Token, TraitItem, TraitItemFn, Type,
    TypeParamBound,
};

/// Arguments for #[rpc_interface]
#[derive(Default)]
struct InterfaceArgs {
    name: Option<LitStr>,
    exchange: Option<LitStr>,
    queue: Option<LitStr>,
    routing: Option<LitStr>,
    concurrency: Option<LitStr>,
    executor: Option<LitStr>,
    serializer: Option<LitStr>,
    error_handler: Option<LitStr>,
    reply_timeout_ms: Option<LitStr>,
    durable: bool,
    allow: Vec<LitStr>,
}

impl Parse for InterfaceArgs {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut args = InterfaceArgs::default();

        for pair in Punctuated::<MetaNameValue, Token![,]>::parse_terminated(input)? {
            let key = pair
                .path
                .get_ident()
                .map(|ident| ident.to_string())
                .ok_or_else(|| syn::Error::new_spanned(&pair.path, "expected a plain key"))?;
            let lit = match &pair.value {
                Expr::Lit(ExprLit { lit, .. }) => lit.clone(),
                other => return Err(syn::Error::new_spanned(other, "expected a literal")),
            };

            // Numbers are accepted where the runtime expects a template string
            let text = match &lit {
                Lit::Str(s) => Some(s.clone()),
                Lit::Int(i) => Some(LitStr::new(i.base10_digits(), i.span())),
                _ => None,
            };

            match (key.as_str(), &lit, text) {
                ("durable", Lit::Bool(b), _) => args.durable = b.value,
                ("allow", _, Some(s)) => args.allow.push(s),
                (key, _, Some(s)) => {
                    let slot = match key {
                        "name" => &mut args.name,
                        "exchange" => &mut args.exchange,
                        "queue" => &mut args.queue,
                        "routing" => &mut args.routing,
                        "concurrency" => &mut args.concurrency,
                        "executor" => &mut args.executor,
                        "serializer" => &mut args.serializer,
                        "error_handler" => &mut args.error_handler,
                        "reply_timeout_ms" => &mut args.reply_timeout_ms,
                        _ => return Err(syn::Error::new_spanned(&pair.path, format!("unknown key `{}`", key))),
                    };
                    *slot = Some(s);
                }
                _ => return Err(syn::Error::new_spanned(&lit, format!("unexpected value for `{}`", key))),
            }
        }

        Ok(args)
    }
}

struct RpcParam {
    ident: Ident,
    ty: Type,
    constraints: Vec<TokenStream2>,
}

struct RpcMethod {
    ident: Ident,
    wire_name: String,
    params: Vec<RpcParam>,
    /// `None` when the method returns `Result<(), _>`
    value: Option<Type>,
    fire_and_forget: bool,
}

/// Implementation of #[rpc_interface]
pub fn impl_rpc_interface(args: TokenStream, input: TokenStream) -> TokenStream {
    let args = parse_macro_input!(args as InterfaceArgs);
    let item = parse_macro_input!(input as ItemTrait);

    match expand(args, item) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(args: InterfaceArgs, mut item: ItemTrait) -> syn::Result<TokenStream2> {
    let required = |value: &Option<LitStr>, key: &str| {
        value
            .clone()
            .ok_or_else(|| syn::Error::new(Span::call_site(), format!("#[rpc_interface] needs `{}`", key)))
    };
    let exchange = required(&args.exchange, "exchange")?;
    let queue = required(&args.queue, "queue")?;
    let routing = required(&args.routing, "routing")?;

    let trait_ident = item.ident.clone();
    let vis = item.vis.clone();
    let contract_ident = format_ident!("{}Contract", trait_ident);
    let client_ident = format_ident!("{}Client", trait_ident);
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| LitStr::new(&trait_ident.to_string(), trait_ident.span()));

    let mut methods = Vec::new();
    let mut client_fns = Vec::new();
    for trait_item in &mut item.items {
        let TraitItem::Fn(method) = trait_item else {
            return Err(syn::Error::new_spanned(trait_item, "rpc interfaces may only contain async methods"));
        };
        methods.push(parse_method(method)?);
        client_fns.push(method.sig.clone());
    }

    for bound in [quote!(Send), quote!(Sync), quote!('static)] {
        let bound: TypeParamBound = parse_quote!(#bound);
        if !item.supertraits.iter().any(|existing| quote!(#existing).to_string() == quote!(#bound).to_string()) {
            item.supertraits.push(bound);
        }
    }

    let declaration = declaration(&args, &exchange, &queue, &routing);
    let signatures = methods.iter().map(signature);
    let handlers = methods.iter().enumerate().map(|(index, method)| handler(index, method));
    let client_bodies = methods.iter().map(client_body);
    let contract_doc = format!("Contract of [`{}`]: descriptor and server binding", trait_ident);
    let client_doc = format!("[`{}`] reached over the broker", trait_ident);

    Ok(quote! {
        #[::rabbit_rpc::async_trait]
        #item

        #[doc = #contract_doc]
        #[derive(Debug, Clone, Copy, Default)]
        #vis struct #contract_ident;

        impl #contract_ident {
            pub const NAME: &'static str = #name;

            /// Serve every method of the interface with `service`
            pub fn binding<S>(service: ::std::sync::Arc<S>) -> ::rabbit_rpc::ServiceBinding
            where
                S: #trait_ident + ?Sized,
            {
                ::rabbit_rpc::ServiceBinding::new(<Self as ::rabbit_rpc::RpcInterface>::descriptor())
                    #(#handlers)*
            }
        }

        impl ::rabbit_rpc::RpcInterface for #contract_ident {
            type Client = #client_ident;

            fn descriptor() -> ::rabbit_rpc::ContractDescriptor {
                ::rabbit_rpc::ContractDescriptor::new(#name, #declaration)
                    #(.method(#signatures))*
            }

            fn client(invoker: ::rabbit_rpc::ClientInvoker) -> Self::Client {
                #client_ident { invoker }
            }
        }

        #[doc = #client_doc]
        #[derive(Clone)]
        #vis struct #client_ident {
            invoker: ::rabbit_rpc::ClientInvoker,
        }

        impl #client_ident {
            pub fn invoker(&self) -> &::rabbit_rpc::ClientInvoker {
                &self.invoker
            }
        }

        #[::rabbit_rpc::async_trait]
        impl #trait_ident for #client_ident {
            #(#client_fns #client_bodies)*
        }
    })
}

fn parse_method(method: &mut TraitItemFn) -> syn::Result<RpcMethod> {
    let sig = &mut method.sig;
    if sig.asyncness.is_none() {
        return Err(syn::Error::new_spanned(&sig.fn_token, "rpc methods must be async"));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(&sig.generics, "rpc methods cannot be generic"));
    }

    let mut wire_name = sig.ident.to_string();
    let mut fire_and_forget = false;
    for attr in &method.attrs {
        if attr.path().is_ident("rpc") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    wire_name = meta.value()?.parse::<LitStr>()?.value();
                    Ok(())
                } else {
                    Err(meta.error("expected `name = \"...\"`"))
                }
            })?;
        } else if attr.path().is_ident("fire_and_forget") {
            fire_and_forget = true;
        }
    }
    method
        .attrs
        .retain(|attr| !attr.path().is_ident("rpc") && !attr.path().is_ident("fire_and_forget"));

    let mut inputs = sig.inputs.iter_mut();
    match inputs.next() {
        Some(FnArg::Receiver(receiver)) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => return Err(syn::Error::new_spanned(&sig.ident, "rpc methods take `&self` first")),
    }

    let mut params = Vec::new();
    for input in inputs {
        let FnArg::Typed(pat_type) = input else {
            return Err(syn::Error::new_spanned(input, "unexpected receiver"));
        };
        let Pat::Ident(pat_ident) = &*pat_type.pat else {
            return Err(syn::Error::new_spanned(&pat_type.pat, "parameters must be plain identifiers"));
        };
        let constraints = constraints(&pat_type.attrs)?;
        pat_type.attrs.retain(|attr| !is_constraint(attr));
        params.push(RpcParam {
            ident: pat_ident.ident.clone(),
            ty: (*pat_type.ty).clone(),
            constraints,
        });
    }

    let value = result_value(&sig.output)?;
    if fire_and_forget && value.is_some() {
        return Err(syn::Error::new_spanned(&sig.output, "fire-and-forget methods must return `Result<(), _>`"));
    }

    Ok(RpcMethod {
        ident: sig.ident.clone(),
        wire_name,
        params,
        value,
        fire_and_forget,
    })
}

/// `T` out of `Result<T, E>`; `None` for unit
fn result_value(output: &ReturnType) -> syn::Result<Option<Type>> {
    let ReturnType::Type(_, ty) = output else {
        return Err(syn::Error::new_spanned(output, "rpc methods return a `Result`"));
    };
    let Type::Path(path) = &**ty else {
        return Err(syn::Error::new_spanned(ty, "rpc methods return a `Result`"));
    };

    let value = path
        .path
        .segments
        .last()
        .filter(|segment| segment.ident == "Result")
        .and_then(|segment| match &segment.arguments {
            PathArguments::AngleBracketed(args) => args.args.first(),
            _ => None,
        })
        .and_then(|arg| match arg {
            GenericArgument::Type(ty) => Some(ty.clone()),
            _ => None,
        })
        .ok_or_else(|| syn::Error::new_spanned(ty, "rpc methods return a `Result`"))?;

    Ok(match value {
        Type::Tuple(tuple) if tuple.elems.is_empty() => None,
        other => Some(other),
    })
}

const CONSTRAINTS: [&str; 6] = ["not_null", "not_blank", "valid", "min", "max", "size"];

fn is_constraint(attr: &Attribute) -> bool {
    CONSTRAINTS.iter().any(|name| attr.path().is_ident(name))
}

fn constraints(attrs: &[Attribute]) -> syn::Result<Vec<TokenStream2>> {
    let mut constraints = Vec::new();
    for attr in attrs.iter().filter(|attr| is_constraint(attr)) {
        let constraint = if attr.path().is_ident("not_null") {
            quote!(::rabbit_rpc::Constraint::NotNull)
        } else if attr.path().is_ident("not_blank") {
            quote!(::rabbit_rpc::Constraint::NotBlank)
        } else if attr.path().is_ident("valid") {
            quote!(::rabbit_rpc::Constraint::Valid)
        } else if attr.path().is_ident("min") {
            let min: LitInt = attr.parse_args()?;
            quote!(::rabbit_rpc::Constraint::Min(#min))
        } else if attr.path().is_ident("max") {
            let max: LitInt = attr.parse_args()?;
            quote!(::rabbit_rpc::Constraint::Max(#max))
        } else {
            let mut min: Option<LitInt> = None;
            let mut max: Option<LitInt> = None;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("min") {
                    min = Some(meta.value()?.parse()?);
                    Ok(())
                } else if meta.path.is_ident("max") {
                    max = Some(meta.value()?.parse()?);
                    Ok(())
                } else {
                    Err(meta.error("expected `min` or `max`"))
                }
            })?;
            let min = min.map(|min| quote!(#min)).unwrap_or_else(|| quote!(0));
            let max = max.map(|max| quote!(#max)).unwrap_or_else(|| quote!(usize::MAX));
            quote!(::rabbit_rpc::Constraint::Size { min: #min, max: #max })
        };
        constraints.push(constraint);
    }
    Ok(constraints)
}

fn declaration(args: &InterfaceArgs, exchange: &LitStr, queue: &LitStr, routing: &LitStr) -> TokenStream2 {
    let optional = [
        ("concurrency", &args.concurrency),
        ("executor", &args.executor),
        ("serializer", &args.serializer),
        ("error_handler", &args.error_handler),
        ("reply_timeout_ms", &args.reply_timeout_ms),
    ]
    .into_iter()
    .filter_map(|(setter, value)| {
        let setter = format_ident!("{}", setter);
        value.as_ref().map(|value| quote!(.#setter(#value)))
    });
    let durable = args.durable;
    let allow = &args.allow;

    quote! {
        ::rabbit_rpc::ContractDeclaration::new(#exchange, #queue, #routing)
            #(#optional)*
            .durable(#durable)
            #(.allow(#allow))*
    }
}

fn signature(method: &RpcMethod) -> TokenStream2 {
    let wire_name = &method.wire_name;
    let params = method.params.iter().map(|param| {
        let ty = &param.ty;
        let name = param.ident.to_string();
        let constraints = &param.constraints;
        quote!(.param::<#ty>(#name) #(.constrained(#constraints))*)
    });
    let returns = method.value.as_ref().map(|ty| quote!(.returns::<#ty>()));
    let fire_and_forget = method.fire_and_forget.then(|| quote!(.fire_and_forget()));

    quote! {
        ::rabbit_rpc::MethodSignature::new(#wire_name)
            #(#params)*
            #returns
            #fire_and_forget
    }
}

fn handler(index: usize, method: &RpcMethod) -> TokenStream2 {
    let ident = &method.ident;
    let names: Vec<&Ident> = method.params.iter().map(|param| &param.ident).collect();
    let takes = method.params.iter().enumerate().map(|(position, param)| {
        let name = &param.ident;
        let ty = &param.ty;
        quote!(let #name = args.take::<#ty>(#position)?;)
    });
    let args = if method.params.is_empty() {
        quote!(_args)
    } else {
        quote!(mut args)
    };
    let call = quote! {
        service
            .#ident(#(#names),*)
            .await
            .map_err(::core::convert::Into::<::rabbit_rpc::__private::anyhow::Error>::into)?
    };
    let body = if method.value.is_some() {
        quote! {
            let value = #call;
            ::core::result::Result::Ok(::rabbit_rpc::Returned::value(value))
        }
    } else {
        quote! {
            #call;
            ::core::result::Result::Ok(::rabbit_rpc::Returned::Void)
        }
    };

    quote! {
        .handler_at(#index, {
            let service = service.clone();
            move |#args: ::rabbit_rpc::Arguments| {
                let service = service.clone();
                async move {
                    #(#takes)*
                    #body
                }
            }
        })
    }
}

fn client_body(method: &RpcMethod) -> TokenStream2 {
    let wire_name = &method.wire_name;
    let names = method.params.iter().map(|param| &param.ident);
    let args = quote!(::rabbit_rpc::CallArgs::new() #(.arg(#names))*);

    if method.fire_and_forget {
        quote!({
            self.invoker.notify(#wire_name, #args).await;
            ::core::result::Result::Ok(())
        })
    } else if let Some(ty) = &method.value {
        quote!({
            self.invoker
                .call::<#ty>(#wire_name, #args)
                .await
                .map_err(::core::convert::Into::into)
        })
    } else {
        quote!({
            self.invoker
                .call_void(#wire_name, #args)
                .await
                .map_err(::core::convert::Into::into)
        })
    }
}
