// Codepatch schema - patch layers and their changed files for Diesel ORM

diesel::table! {
    patches (id) {
        id -> Integer,
        title -> Text,
        created_at -> Text,
        modified_at -> Text,
        base_patch_id -> Nullable<Integer>,   // NULL for root patches
        commit_hash -> Nullable<Text>,        // set only on root patches
        metadata_json -> Text,
    }
}

diesel::table! {
    changed_files (id) {
        id -> Integer,
        patch_id -> Integer,                  // FK to patches, owning layer
        filename -> Text,
        title -> Text,
        metadata_json -> Text,
        diff_json -> Text,                    // {"content": "..."} or {}
    }
}

diesel::joinable!(changed_files -> patches (patch_id));

diesel::allow_tables_to_appear_in_same_query!(patches, changed_files);
