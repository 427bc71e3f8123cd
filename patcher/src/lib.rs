/*!
 * Low level tools for changing code we don't own: turning RVAs into addresses, checking bytes
 * before touching them, writing patches that can be undone, and redirecting vtable slots.
 *
 * Everything goes through `util::memory::ProcessMemory`, so it all works the same against the
 * live process and against `MockMemory` in tests.
*/

pub mod address;
pub mod code_patch;
pub mod jump;
pub mod signature;
pub mod vtable;
