//! Standard JSON-RPC 2.0 transport error codes, reserved for faults below
//! the tool-call layer (§7: "transport faults are out of scope for the
//! core"). Tool-level failures never use these; they carry `isError: true`
//! in an otherwise normal response instead.

/// Invalid JSON was received by the broker.
pub const PARSE_ERROR: i64 = -32700;

/// The JSON sent is not a valid Request object.
pub const INVALID_REQUEST: i64 = -32600;

/// The tool name does not exist in §6's surface.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Invalid tool argument object (missing required field, wrong type).
pub const INVALID_PARAMS: i64 = -32602;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_in_the_json_rpc_reserved_range() {
        for code in [PARSE_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND, INVALID_PARAMS] {
            assert!((-32768..=-32000).contains(&code));
        }
    }
}
