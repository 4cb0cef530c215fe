pub mod error;
pub mod handler;
pub mod hash;
pub mod options;
pub mod schema;
pub mod value;
pub mod header;
pub mod descriptor;
pub mod instance;
pub mod container;

pub use error::{Result, RszError};
pub use handler::FileHandler;
pub use options::{FormatOptions, UserdataShape};
pub use schema::{ClassSchema, FieldSchema, SchemaError, SchemaRegistry, TypeRegistry};
pub use value::{FieldType, ObjectRef, Value};
pub use header::RszHeader;
pub use descriptor::{InstanceInfo, UserdataInfos, UserdataLink};
pub use instance::{Instance, InstanceId};
pub use container::{Diagnostic, RszFile};
