//! Per-body token table.
//!
//! Instructions refer to constants, fields, routines and types through u16
//! indices into this table. Identical tokens share one entry.

use kiln_core::{ConstantValue, InternalFault, SymbolId, Ty};
use rustc_hash::FxHashMap;

/// Highest number of entries a single body may reference.
pub const MAX_TOKENS: usize = u16::MAX as usize + 1;

/// A metadata reference made by an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Token {
    Constant(ConstantValue),
    Field(SymbolId),
    Routine(SymbolId),
    Type(Ty),
}

#[derive(Debug, Clone)]
pub struct TokenTable {
    owner: SymbolId,
    tokens: Vec<Token>,
    index: FxHashMap<Token, u16>,
}

impl TokenTable {
    pub fn new(owner: SymbolId) -> Self {
        Self {
            owner,
            tokens: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Add or find `token`, returning its index.
    pub fn intern(&mut self, token: Token) -> Result<u16, InternalFault> {
        if let Some(&idx) = self.index.get(&token) {
            return Ok(idx);
        }
        if self.tokens.len() >= MAX_TOKENS {
            return Err(InternalFault::SlotOverflow {
                routine: self.owner,
                limit: MAX_TOKENS,
            });
        }
        let idx = self.tokens.len() as u16;
        self.tokens.push(token.clone());
        self.index.insert(token, idx);
        Ok(idx)
    }

    pub fn constant(&mut self, value: &ConstantValue) -> Result<u16, InternalFault> {
        self.intern(Token::Constant(value.clone()))
    }

    pub fn field(&mut self, id: SymbolId) -> Result<u16, InternalFault> {
        self.intern(Token::Field(id))
    }

    pub fn routine(&mut self, id: SymbolId) -> Result<u16, InternalFault> {
        self.intern(Token::Routine(id))
    }

    pub fn ty(&mut self, ty: &Ty) -> Result<u16, InternalFault> {
        self.intern(Token::Type(ty.clone()))
    }

    pub fn get(&self, index: u16) -> Option<&Token> {
        self.tokens.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter()
    }

    pub fn into_vec(self) -> Vec<Token> {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_tokens_share_an_index() {
        let mut table = TokenTable::new(SymbolId::EMPTY);
        let a = table.constant(&ConstantValue::Int(7)).unwrap();
        let b = table.ty(&Ty::Int).unwrap();
        let c = table.constant(&ConstantValue::Int(7)).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(b), Some(&Token::Type(Ty::Int)));
    }

    #[test]
    fn float_constants_deduplicate_by_value() {
        let mut table = TokenTable::new(SymbolId::EMPTY);
        let a = table.constant(&ConstantValue::float(1.5)).unwrap();
        let b = table.constant(&ConstantValue::float(1.5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn overflow_is_a_fault() {
        let mut table = TokenTable::new(SymbolId(9));
        for i in 0..MAX_TOKENS {
            table.constant(&ConstantValue::Int(i as i64)).unwrap();
        }
        let err = table.constant(&ConstantValue::Int(-1)).unwrap_err();
        assert_eq!(
            err,
            InternalFault::SlotOverflow {
                routine: SymbolId(9),
                limit: MAX_TOKENS
            }
        );
    }
}
