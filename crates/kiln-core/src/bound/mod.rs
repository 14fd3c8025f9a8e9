//! The bound tree: the type-checked input of lowering and code generation.
//!
//! Nodes form a closed tagged union ([`ExprKind`], [`StmtKind`]) so every
//! consumer matches exhaustively. Each node carries its type and a sticky
//! `has_errors` marker: a constructor sets it when any child has it, and
//! the [`Rewriter`] traversal carries it over to the node a rewrite produces.
//! Later stages look only at the root's marker to short-circuit.

mod expr;
mod stmt;
mod visit;

pub use expr::{BinaryOp, ConversionKind, Expr, ExprKind, UnaryOp};
pub use stmt::{CatchClause, Stmt, StmtKind};
pub use visit::{
    Rewriter, Visitor, contains_expr, contains_stmt, rewrite_expr_children,
    rewrite_stmt_children, walk_expr, walk_stmt,
};
