//! Scratch space for rkyv wire-format experiments against the durable
//! schema `kb-storage::repo` actually persists, kept separate from the
//! production crates so a throwaway benchmark fixture never needs its own
//! stability guarantees.

#[cfg(test)]
mod tests {
    use kb_storage::repo::StoredChunk;

    #[test]
    fn stored_chunk_round_trips_zero_copy() {
        let chunk = StoredChunk {
            id: "chunk-1".to_string(),
            doc_id: "doc-1".to_string(),
            kb_id: "kb-1".to_string(),
            tenant_id: "acme".to_string(),
            ordinal: 0,
            text: "EV battery partnerships expand across three plants.".to_string(),
            metadata_json: "{\"source\":\"report.md\"}".to_string(),
            sensitivity_level: 0,
            allow_users: vec![],
            allow_roles: vec!["analyst".to_string()],
            allow_groups: vec![],
            indexing_status: 1,
            last_error: None,
        };

        let bytes = rkyv::to_bytes::<_, 256>(&chunk).expect("failed to serialize");
        let archived = unsafe { rkyv::archived_root::<StoredChunk>(&bytes[..]) };

        assert_eq!(archived.id, "chunk-1");
        assert_eq!(archived.tenant_id, "acme");
        assert_eq!(archived.allow_roles.len(), 1);
    }
}
