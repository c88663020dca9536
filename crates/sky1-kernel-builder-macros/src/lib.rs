use proc_macro::TokenStream;

use quote::quote;
use syn::parse_quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Marks a struct as one step of a pipeline stage.
///
/// ```ignore
/// #[Step(
///     id = "build.compile",
///     stage = "build",
///     phase = "compile",
///     after = ["build.configure"],
///     tools = ["make"],
///     default_label = "Compile kernel packages",
///     required = true
/// )]
/// pub struct CompileStep { pub enabled: bool, pub label: Option<String> }
/// ```
///
/// The struct doubles as the step's own config (`<stage>.steps.<step>` unless
/// `config_path` says otherwise) and must provide
/// `fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Step(attr: TokenStream, item: TokenStream) -> TokenStream {
    match step_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

/// Groups steps into a stage and implements `Stage` + `StageExec` for it.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Stage(attr: TokenStream, item: TokenStream) -> TokenStream {
    match stage_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn str_list(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn path_list(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems
        .iter()
        .map(|e| match e {
            Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
            _ => Err(syn::Error::new(e.span(), "expected path (identifier)")),
        })
        .collect()
}

fn type_of(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => syn::parse_str::<syn::Type>(&s.value()).map_err(|e| syn::Error::new(expr.span(), e)),
        _ => Err(syn::Error::new(
            expr.span(),
            "expected type (path) or string",
        )),
    }
}

fn without_own_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| match &a.meta {
            Meta::Path(p) => p.get_ident().is_none_or(|i| i != "Step" && i != "Stage"),
            _ => true,
        })
        .cloned()
        .collect()
}

fn key_values(attr: TokenStream) -> syn::Result<Vec<(String, Expr, proc_macro2::Span)>> {
    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;
    let mut out = Vec::new();
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        out.push((key, nv.value, nv.path.span()));
    }
    Ok(out)
}

fn step_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = without_own_attrs(&st.attrs);
    let ident = st.ident.clone();
    let missing = |what: &str| syn::Error::new(ident.span(), format!("Step: missing {what}"));

    let mut id: Option<String> = None;
    let mut stage: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut tools: Vec<String> = Vec::new();
    let mut default_label: Option<String> = None;
    let mut required = false;

    for (key, v, span) in key_values(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "stage" => stage = Some(lit_str(&v)?),
            "phase" => phase = Some(lit_str(&v)?),
            "config" => config_ty = Some(type_of(&v)?),
            "config_path" => config_path = Some(lit_str(&v)?),
            "provides" => provides = str_list(&v)?,
            "after" => after = str_list(&v)?,
            "tools" => tools = str_list(&v)?,
            "default_label" => default_label = Some(lit_str(&v)?),
            "required" => required = lit_bool(&v)?,
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Step attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| missing("id"))?;
    let stage = stage.ok_or_else(|| missing("stage"))?;
    let phase = phase.ok_or_else(|| missing("phase"))?;
    let default_label = default_label.ok_or_else(|| missing("default_label"))?;
    let config_ty = config_ty.unwrap_or_else(|| parse_quote!(#ident));

    let config_path = match config_path {
        Some(p) => p,
        None => {
            let Some(step) = id.strip_prefix(&format!("{stage}.")) else {
                return Err(syn::Error::new(
                    ident.span(),
                    "Step: config_path omitted but id does not start with '<stage>.'",
                ));
            };
            format!("{stage}.steps.{step}")
        }
    };

    let enabled_check = if required {
        quote! {
            if !cfg.enabled {
                return Err(crate::Error::msg(format!(
                    "[{}].enabled=false is not allowed (required step)",
                    #config_path
                )));
            }
        }
    } else {
        quote! {
            if !cfg.enabled {
                return Ok(());
            }
        }
    };

    let expanded = quote! {
        #st

        impl #ident {
            pub const ID: &'static str = #id;
            pub const STAGE: &'static str = #stage;
            pub const PHASE: &'static str = #phase;
            pub const CONFIG_PATH: &'static str = #config_path;
            pub const TOOLS: &'static [&'static str] = &[#(#tools),*];

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();
                #enabled_check

                let label = cfg
                    .label
                    .clone()
                    .unwrap_or_else(|| #default_label.to_string());
                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label,
                    stage: #stage.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })?;
                Ok(())
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();
                #enabled_check

                if !ctx.dry_run {
                    crate::executor::require_tools(Self::TOOLS)?;
                }
                Self::run(&cfg, doc, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn stage_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = without_own_attrs(&st.attrs);
    let ident = st.ident.clone();
    let missing = |what: &str| syn::Error::new(ident.span(), format!("Stage: missing {what}"));

    let mut id: Option<String> = None;
    let mut steps: Option<Vec<syn::Path>> = None;

    for (key, v, span) in key_values(attr)? {
        match key.as_str() {
            "id" => id = Some(lit_str(&v)?),
            "steps" => steps = Some(path_list(&v)?),
            other => {
                return Err(syn::Error::new(
                    span,
                    format!("unknown Stage attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| missing("id"))?;
    let steps = steps.ok_or_else(|| missing("steps"))?;

    let plan_steps = steps.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let register_steps = steps.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    // Stages are always planned: every pipeline run carries all of them and the
    // caller narrows the plan with `Plan::subset` when only one is wanted.
    let expanded = quote! {
        #st

        impl crate::stages::Stage for #ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let enabled = doc
                    .value_path(&format!("{}.enabled", #id))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                if !enabled {
                    return Ok(());
                }
                #(#plan_steps)*
                Ok(())
            }
        }

        impl crate::executor::StageExec for #ident {
            fn register_steps(reg: &mut crate::executor::StepRegistry) -> crate::Result<()> {
                #(#register_steps)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
