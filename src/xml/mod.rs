pub mod escape;
pub mod parser;

pub const EXIST_NS: &str = "http://exist.sourceforge.net/NS/exist";
pub const XUPDATE_NS: &str = "http://www.xmldb.org/xupdate";
pub const SERIALIZED_NS: &str = "http://exist-db.org/xquery/types/serialized";
