//! Binding of the base or chained constructor call that starts a
//! constructor body.
//!
//! ## Lookup
//!
//! 1. Keep the target type's constructors accessible from the caller
//! 2. Keep those taking as many parameters as there are arguments
//! 3. Keep those whose parameters accept every argument
//! 4. Rank by total conversion cost; a tie at the lowest cost is ambiguous
//!
//! An implicit initializer on a type deriving straight from the root skips
//! the lookup and calls the root's parameterless constructor.

use std::sync::Arc;

use kiln_core::bound::{Expr, Stmt};
use kiln_core::symbols::{RoutineDescriptor, TypeDescriptor};
use kiln_core::{DiagnosticBag, DiagnosticKind, Span, Ty};

use crate::collaborators::ConstructorInitializer;

/// Cost of passing an `arg` where `param` is expected, if it is allowed.
fn conversion_cost(arg: &Ty, param: &Ty) -> Option<u32> {
    match (arg, param) {
        _ if arg == param => Some(0),
        // Already reported by the binder; accept anything.
        (Ty::Error, _) => Some(0),
        (Ty::Int, Ty::Float) => Some(1),
        (Ty::Void, _) => None,
        (_, Ty::Object) if arg.is_value_type() => Some(3),
        (_, Ty::Object) => Some(2),
        _ => None,
    }
}

fn call_cost(candidate: &RoutineDescriptor, args: &[Expr]) -> Option<u32> {
    candidate
        .parameters
        .iter()
        .zip(args)
        .map(|(param, arg)| conversion_cost(&arg.ty, &param.ty))
        .sum()
}

/// Pick the constructor of `target` that `args` call from inside `from`.
fn resolve_constructor<'t>(
    target: &'t TypeDescriptor,
    from: &TypeDescriptor,
    args: &[Expr],
    span: Span,
    diagnostics: &mut DiagnosticBag,
) -> Option<&'t Arc<RoutineDescriptor>> {
    let applicable: Vec<(&Arc<RoutineDescriptor>, u32)> = target
        .constructors()
        .filter(|ctor| ctor.parameters.len() == args.len())
        .filter_map(|ctor| call_cost(ctor, args).map(|cost| (ctor, cost)))
        .collect();
    let accessible: Vec<_> = applicable
        .iter()
        .filter(|(ctor, _)| ctor.is_accessible_from(from))
        .collect();

    let Some(best) = accessible.iter().map(|(_, cost)| *cost).min() else {
        let kind = match applicable.first() {
            Some((ctor, _)) => DiagnosticKind::InaccessibleMember {
                member: ctor.qualified_name(),
            },
            None => DiagnosticKind::NoMatchingConstructor {
                type_name: target.name.to_string(),
                arg_count: args.len(),
            },
        };
        diagnostics.add(kind, span);
        return None;
    };

    let mut winners = accessible.iter().filter(|(_, cost)| *cost == best);
    let winner = winners.next().map(|(ctor, _)| *ctor);
    if winners.next().is_some() {
        diagnostics.add(
            DiagnosticKind::AmbiguousConstructor {
                type_name: target.name.to_string(),
            },
            span,
        );
        return None;
    }
    winner
}

/// A base type that can take a constructor call.
fn callable_base(ty: &TypeDescriptor) -> Option<&Arc<TypeDescriptor>> {
    ty.base
        .as_ref()
        .filter(|base| !base.is_error() && !base.is_static())
}

fn failed(span: Span) -> Stmt {
    Stmt::expr(Expr::error(Ty::Void).at(span)).at(span)
}

/// The statement calling the base or chained constructor of `ctor`.
///
/// `None` when there is nothing to call. A failed lookup reports into
/// `diagnostics` and returns an error-marked statement.
pub fn bind_constructor_initializer(
    ctor: &RoutineDescriptor,
    containing: &TypeDescriptor,
    initializer: &ConstructorInitializer,
    diagnostics: &mut DiagnosticBag,
) -> Option<Stmt> {
    let (target, receiver, args, span) = match initializer {
        ConstructorInitializer::This { args, span } => {
            (containing, Expr::this(containing.ty()), args.as_slice(), *span)
        }
        _ if containing.is_value_type() => return None,
        ConstructorInitializer::Base { args, span } => {
            let base = callable_base(containing)?;
            (base.as_ref(), Expr::base(base.ty()), args.as_slice(), *span)
        }
        ConstructorInitializer::Implicit => {
            let base = callable_base(containing)?;
            let span = ctor.span;
            if base.is_root() {
                let Some(root_ctor) = base.constructors().find(|c| c.parameters.is_empty()) else {
                    diagnostics.add(
                        DiagnosticKind::NoMatchingConstructor {
                            type_name: base.name.to_string(),
                            arg_count: 0,
                        },
                        span,
                    );
                    return Some(failed(span));
                };
                if !root_ctor.is_accessible_from(containing) {
                    diagnostics.add(
                        DiagnosticKind::InaccessibleMember {
                            member: root_ctor.qualified_name(),
                        },
                        span,
                    );
                    return Some(failed(span));
                }
                let call = Expr::call(Some(Expr::base(base.ty())), root_ctor, Vec::new());
                return Some(Stmt::expr(call.at(span)).at(span));
            }
            (base.as_ref(), Expr::base(base.ty()), &[][..], span)
        }
    };

    match resolve_constructor(target, containing, args, span, diagnostics) {
        Some(resolved) => {
            let call = Expr::call(Some(receiver), resolved, args.to_vec());
            Some(Stmt::expr(call.at(span)).at(span))
        }
        None => Some(failed(span)),
    }
}
