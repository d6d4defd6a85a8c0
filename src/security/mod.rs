//! Safe construction of statement text from caller-supplied names.

pub mod identifier;

pub use identifier::{
    dollar_quote, quote_ident, quote_ident_list, quote_literal, quote_qualified,
    validate_fragment, validate_keyword, validate_statement, validate_type_expr,
};
