extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use std::collections::HashMap;
use syn::parse::{Parse, ParseStream};
use syn::{bracketed, parenthesized, Expr, Ident, Result, Token};

enum TermArg {
    Variable(Ident),
    Anonymous,
    Constant(Expr),
}

struct AtomArgs {
    name: Ident,
    args: Vec<TermArg>,
    sign: bool,
}

struct RuleMacroInput {
    head: AtomArgs,
    body: Vec<AtomArgs>,
}

impl Parse for TermArg {
    fn parse(input: ParseStream) -> Result<Self> {
        if input.peek(Token![?]) {
            input.parse::<Token![?]>()?;
            let ident: Ident = input.parse()?;
            Ok(TermArg::Variable(ident))
        } else if input.peek(Token![_]) {
            input.parse::<Token![_]>()?;
            Ok(TermArg::Anonymous)
        } else {
            let expr: Expr = input.parse()?;
            Ok(TermArg::Constant(expr))
        }
    }
}

impl Parse for AtomArgs {
    fn parse(input: ParseStream) -> Result<Self> {
        let sign = if input.peek(Token![!]) {
            input.parse::<Token![!]>()?;
            false
        } else {
            true
        };

        let name: Ident = input.parse()?;
        let content;
        parenthesized!(content in input);
        let args = content
            .parse_terminated::<TermArg, Token![,]>(TermArg::parse)?
            .into_iter()
            .collect();

        Ok(AtomArgs { name, args, sign })
    }
}

impl Parse for RuleMacroInput {
    fn parse(input: ParseStream) -> Result<Self> {
        let head = input.parse::<AtomArgs>()?;

        for arg in &head.args {
            if matches!(arg, TermArg::Anonymous) {
                return Err(syn::Error::new(
                    head.name.span(),
                    "anonymous variable in rule head",
                ));
            }
        }

        let mut head_variables: HashMap<String, (&Ident, bool)> = head
            .args
            .iter()
            .filter_map(|term| match term {
                TermArg::Variable(ident) => Some((ident.to_string(), (ident, false))),
                _ => None,
            })
            .collect();

        input.parse::<Token![<-]>()?;
        let content;
        bracketed!(content in input);
        let body: syn::punctuated::Punctuated<AtomArgs, Token![,]> =
            content.parse_terminated(AtomArgs::parse)?;
        let body_vec: Vec<AtomArgs> = body.into_iter().collect();

        // Only positive atoms bind; a head variable occurring solely under
        // negation is still free.
        for body_atom in body_vec.iter().filter(|atom| atom.sign) {
            for arg in &body_atom.args {
                if let TermArg::Variable(ident) = arg {
                    if let Some(entry) = head_variables.get_mut(&ident.to_string()) {
                        entry.1 = true;
                    }
                }
            }
        }

        for (name, (ident, bound)) in head_variables {
            if !bound {
                return Err(syn::Error::new(
                    ident.span(),
                    format!("variable {} not found in a positive body atom", name),
                ));
            }
        }

        Ok(RuleMacroInput {
            head,
            body: body_vec,
        })
    }
}

fn emit_term(arg: &TermArg) -> TokenStream2 {
    match arg {
        TermArg::Variable(ident) => quote! { Term::Variable(stringify!(#ident).to_string()) },
        TermArg::Anonymous => quote! { Term::Variable(ANONYMOUS.to_string()) },
        TermArg::Constant(expr) => quote! { Term::Constant(TypedValue::from(#expr)) },
    }
}

fn emit_atom(atom: &AtomArgs) -> TokenStream2 {
    let name = &atom.name;
    let terms: Vec<_> = atom.args.iter().map(emit_term).collect();
    let sign = atom.sign;
    quote! {
        Atom {
            terms: vec![#(#terms),*],
            symbol: stringify!(#name).to_string(),
            sign: #sign,
            agg: None,
        }
    }
}

fn emit_rule(rule: &RuleMacroInput) -> TokenStream2 {
    let head = emit_atom(&rule.head);
    let body_atoms: Vec<_> = rule.body.iter().map(emit_atom).collect();
    quote! {
        Rule {
            head: #head,
            body: vec![#(#body_atoms),*],
            id: 0,
        }
    }
}

/// `rule! { head(?x, ?y) <- [a(?x, ?z), !b(?z, ?y), c(_, ?y)] }`
#[proc_macro]
pub fn rule(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as RuleMacroInput);

    emit_rule(&input).into()
}

struct ProgramMacroInput {
    rules: syn::punctuated::Punctuated<RuleMacroInput, Token![,]>,
}

impl Parse for ProgramMacroInput {
    fn parse(input: ParseStream) -> Result<Self> {
        let rules = input.parse_terminated(RuleMacroInput::parse)?;
        Ok(ProgramMacroInput { rules })
    }
}

/// Comma-separated `rule!` bodies producing a `Program` with rule ids
/// assigned in listing order.
#[proc_macro]
pub fn program(input: TokenStream) -> TokenStream {
    let input = syn::parse_macro_input!(input as ProgramMacroInput);

    let rules: Vec<_> = input.rules.iter().map(emit_rule).collect();

    let expanded = quote! {
        Program::from(vec![#(#rules),*])
    };

    expanded.into()
}
