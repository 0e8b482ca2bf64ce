// Adapters
//
// Concrete implementations of the kernel's external seams.

pub mod acl;
