// Diesel table definitions for the import pipeline store.
// Kept in column order matching repository/records.rs structs.

diesel::table! {
    import_files (id) {
        id -> Text,
        catalog_id -> Text,
        origin -> Text,
        status -> Text,
        content_hash -> Text,
        mime_type -> Text,
        size_bytes -> BigInt,
        storage_path -> Text,
        scheduled_import_id -> Nullable<Text>,
        is_duplicate -> Integer,
        metadata -> Text,
        error -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    import_jobs (id) {
        id -> Text,
        import_file_id -> Text,
        dataset_id -> Text,
        sheet_name -> Nullable<Text>,
        stage -> Text,
        rows_total -> BigInt,
        rows_processed -> BigInt,
        events_created -> BigInt,
        geocoded_count -> BigInt,
        duplicate_summary -> Text,
        schema_validation -> Text,
        geocode_summary -> Text,
        batch_size -> BigInt,
        total_batches -> BigInt,
        batches_completed -> BigInt,
        error_log -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    scheduled_imports (id) {
        id -> Text,
        name -> Text,
        source_url -> Text,
        auth -> Text,
        schedule -> Text,
        webhook_token -> Text,
        webhook_enabled -> Integer,
        enabled -> Integer,
        catalog_id -> Text,
        dataset_id -> Nullable<Text>,
        created_by -> Text,
        retry -> Text,
        skip_duplicate_check -> Integer,
        expected_content_type -> Nullable<Text>,
        last_run -> Nullable<Text>,
        last_status -> Nullable<Text>,
        last_error -> Nullable<Text>,
        next_run -> Nullable<Text>,
        execution_history -> Text,
        stats -> Text,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    datasets (id) {
        id -> Text,
        catalog_id -> Text,
        name -> Text,
        config -> Text,
        id_strategy -> Text,
        transformations -> Text,
        address_field -> Nullable<Text>,
        current_schema_version -> Nullable<Integer>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    schema_versions (id) {
        id -> Integer,
        dataset_id -> Text,
        version -> Integer,
        fields -> Text,
        approved_by -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    events (id) {
        id -> Text,
        dataset_id -> Text,
        import_file_id -> Text,
        import_job_id -> Text,
        data -> Text,
        validation_status -> Text,
        transform_notes -> Text,
        row_hash -> Text,
        address -> Nullable<Text>,
        geocode -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::table! {
    location_cache (address) {
        address -> Text,
        latitude -> Double,
        longitude -> Double,
        confidence -> Double,
        provider -> Text,
        normalized_address -> Text,
        hits -> BigInt,
        created_at -> Text,
    }
}

diesel::table! {
    usage_counters (id) {
        id -> Text,
        user_id -> Text,
        day -> Text,
        kind -> Text,
        count -> BigInt,
    }
}

diesel::table! {
    webhook_hits (id) {
        id -> Integer,
        token -> Text,
        timestamp_ms -> BigInt,
    }
}

diesel::table! {
    queued_jobs (id) {
        id -> Text,
        task -> Text,
        payload -> Text,
        status -> Text,
        run_at -> Text,
        attempts -> Integer,
        error -> Nullable<Text>,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::joinable!(import_jobs -> import_files (import_file_id));
diesel::joinable!(schema_versions -> datasets (dataset_id));
diesel::joinable!(events -> datasets (dataset_id));
diesel::joinable!(events -> import_jobs (import_job_id));

diesel::allow_tables_to_appear_in_same_query!(
    import_files,
    import_jobs,
    scheduled_imports,
    datasets,
    schema_versions,
    events,
    location_cache,
    usage_counters,
    webhook_hits,
    queued_jobs,
);
