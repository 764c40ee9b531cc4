use super::value::ScalarType;
use serde::{Deserialize, Serialize};

/// Source position attached by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Span { line, col }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A type-annotated program handed over by the front end, in program order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub body: Vec<Stmt>,

    /// When set, top-level declarations live in this module's register block.
    #[serde(default)]
    pub module: Option<u8>,
}

impl Program {
    pub fn new(body: Vec<Stmt>) -> Self {
        Program { body, module: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    // ───────────────────────────── Bindings ─────────────────────────────
    /// `let name = value`. The binding's scalar type is `value.ty`.
    Let { name: String, value: Expr },

    Assign { name: String, value: Expr },

    // ──────────────────────────── Expressions ───────────────────────────
    Expr(Expr),
    Print(Expr),

    // ─────────────────────────── Control flow ───────────────────────────
    Block(Vec<Stmt>),
    If {
        cond: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },

    /// `for var in start..end` over i32, end exclusive.
    ForRange {
        var: String,
        start: Expr,
        end: Expr,
        body: Vec<Stmt>,
    },
    Break,
    Continue,

    // ───────────────────────────── Functions ────────────────────────────
    Function(FunctionDecl),
    Return(Option<Expr>),

    // ───────────────────────────── Errors ───────────────────────────────
    Try {
        body: Vec<Stmt>,
        catch_name: Option<String>,
        handler: Vec<Stmt>,
    },
    Throw(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub ty: Option<ScalarType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,

    /// Best-known scalar type from inference, `None` when unknown.
    #[serde(default)]
    pub ty: Option<ScalarType>,
    #[serde(default)]
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Literal(Literal),
    Variable(String),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Lambda(Box<FunctionDecl>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Nil,
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    Str(String),
}

impl Literal {
    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self {
            Literal::Bool(_) => Some(ScalarType::Bool),
            Literal::I32(_) => Some(ScalarType::I32),
            Literal::I64(_) => Some(ScalarType::I64),
            Literal::U32(_) => Some(ScalarType::U32),
            Literal::U64(_) => Some(ScalarType::U64),
            Literal::F64(_) => Some(ScalarType::F64),
            Literal::Nil | Literal::Str(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

// ───────────────────────────── Builders ─────────────────────────────
//
// Front ends and tests assemble trees with these. Literal builders fill in
// the scalar type; the others leave it to the caller via `typed`.

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Expr {
            kind,
            ty: None,
            span: Span::default(),
        }
    }

    pub fn literal(lit: Literal) -> Self {
        let ty = lit.scalar_type();
        Expr {
            kind: ExprKind::Literal(lit),
            ty,
            span: Span::default(),
        }
    }

    pub fn i32(n: i32) -> Self {
        Expr::literal(Literal::I32(n))
    }

    pub fn i64(n: i64) -> Self {
        Expr::literal(Literal::I64(n))
    }

    pub fn f64(n: f64) -> Self {
        Expr::literal(Literal::F64(n))
    }

    pub fn bool(b: bool) -> Self {
        Expr::literal(Literal::Bool(b))
    }

    pub fn str(s: &str) -> Self {
        Expr::literal(Literal::Str(s.to_string()))
    }

    pub fn nil() -> Self {
        Expr::literal(Literal::Nil)
    }

    pub fn var(name: &str) -> Self {
        Expr::new(ExprKind::Variable(name.to_string()))
    }

    /// Binary expression; the result type follows the operands when they agree.
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        let ty = match (lhs.ty, rhs.ty) {
            (Some(a), Some(b)) if a == b && op.is_comparison() => Some(ScalarType::Bool),
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        };
        Expr {
            kind: ExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            span: Span::default(),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        let ty = match op {
            UnaryOp::Not => Some(ScalarType::Bool),
            UnaryOp::Neg => operand.ty,
        };
        Expr {
            kind: ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
            span: Span::default(),
        }
    }

    pub fn call(callee: Expr, args: Vec<Expr>) -> Self {
        Expr::new(ExprKind::Call {
            callee: Box::new(callee),
            args,
        })
    }

    pub fn lambda(params: Vec<Param>, body: Vec<Stmt>) -> Self {
        Expr::new(ExprKind::Lambda(Box::new(FunctionDecl {
            name: String::new(),
            params,
            body,
        })))
    }

    pub fn typed(mut self, ty: ScalarType) -> Self {
        self.ty = Some(ty);
        self
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Stmt {
            kind,
            span: Span::default(),
        }
    }

    pub fn let_(name: &str, value: Expr) -> Self {
        Stmt::new(StmtKind::Let {
            name: name.to_string(),
            value,
        })
    }

    pub fn assign(name: &str, value: Expr) -> Self {
        Stmt::new(StmtKind::Assign {
            name: name.to_string(),
            value,
        })
    }

    pub fn expr(e: Expr) -> Self {
        Stmt::new(StmtKind::Expr(e))
    }

    pub fn print(e: Expr) -> Self {
        Stmt::new(StmtKind::Print(e))
    }

    pub fn block(body: Vec<Stmt>) -> Self {
        Stmt::new(StmtKind::Block(body))
    }

    pub fn if_(cond: Expr, then_branch: Vec<Stmt>, else_branch: Option<Vec<Stmt>>) -> Self {
        Stmt::new(StmtKind::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    pub fn while_(cond: Expr, body: Vec<Stmt>) -> Self {
        Stmt::new(StmtKind::While { cond, body })
    }

    pub fn for_range(var: &str, start: Expr, end: Expr, body: Vec<Stmt>) -> Self {
        Stmt::new(StmtKind::ForRange {
            var: var.to_string(),
            start,
            end,
            body,
        })
    }

    pub fn function(name: &str, params: Vec<Param>, body: Vec<Stmt>) -> Self {
        Stmt::new(StmtKind::Function(FunctionDecl {
            name: name.to_string(),
            params,
            body,
        }))
    }

    pub fn return_(value: Option<Expr>) -> Self {
        Stmt::new(StmtKind::Return(value))
    }

    pub fn try_(body: Vec<Stmt>, catch_name: Option<&str>, handler: Vec<Stmt>) -> Self {
        Stmt::new(StmtKind::Try {
            body,
            catch_name: catch_name.map(str::to_string),
            handler,
        })
    }

    pub fn throw(e: Expr) -> Self {
        Stmt::new(StmtKind::Throw(e))
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

impl Param {
    pub fn new(name: &str, ty: Option<ScalarType>) -> Self {
        Param {
            name: name.to_string(),
            ty,
        }
    }
}
