use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::config::AppConfig;
use crate::handlers::{
    admin, auth, categories, chunks, export, files, folders, share, storage, trash,
};
use crate::state::AppState;

pub fn api_routes(config: &AppConfig) -> OpenApiRouter<AppState> {
    let max_file_size = config.storage.max_file_size;

    OpenApiRouter::new()
        .nest("/auth", auth_routes())
        .nest("/files", file_routes(max_file_size))
        .nest("/folders", folder_routes())
        .nest("/trash", trash_routes())
        .nest("/storage", storage_routes())
        .nest("/categories", category_routes())
        .nest("/export", export_routes())
        .nest("/share", share_routes())
        .nest("/admin", admin_routes())
}

fn auth_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(auth::status))
        .routes(routes!(auth::register))
        .routes(routes!(auth::me))
        .routes(routes!(auth::token))
        .routes(routes!(auth::refresh))
}

fn file_routes(max_file_size: u64) -> OpenApiRouter<AppState> {
    let crud = OpenApiRouter::new()
        .routes(routes!(files::list_files))
        .routes(routes!(
            files::get_file,
            files::update_file,
            files::delete_file
        ))
        .routes(routes!(files::purge_file))
        .routes(routes!(files::restore_file))
        .routes(routes!(files::download_file))
        .routes(routes!(files::preview_file))
        .routes(routes!(files::share_file))
        .routes(routes!(chunks::chunk_init))
        .routes(routes!(chunks::chunk_finalize))
        .routes(routes!(chunks::chunk_status))
        .routes(routes!(chunks::chunk_abort));

    let upload = OpenApiRouter::new()
        .routes(routes!(files::upload))
        .routes(routes!(chunks::chunk_upload))
        .layer(files::upload_body_limit(max_file_size));

    let batch = OpenApiRouter::new()
        .routes(routes!(files::batch_upload))
        .layer(files::batch_body_limit(max_file_size));

    crud.merge(upload).merge(batch)
}

fn folder_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(folders::create_folder))
        .routes(routes!(folders::move_entry))
        .routes(routes!(folders::rename_entry))
}

fn trash_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(trash::list_trash))
        .routes(routes!(trash::empty_trash))
}

fn storage_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(routes!(storage::storage_stats))
}

fn category_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(
            categories::list_categories,
            categories::create_category
        ))
        .routes(routes!(
            categories::get_category,
            categories::update_category,
            categories::delete_category
        ))
        .routes(routes!(categories::list_category_files))
}

fn export_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(export::create_export))
        .routes(routes!(export::quick_export))
        .routes(routes!(export::export_status))
        .routes(routes!(export::download_export))
        .routes(routes!(export::export_history))
        .routes(routes!(export::cancel_export))
}

fn share_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().routes(routes!(share::download_shared))
}

fn admin_routes() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(admin::list_users))
        .routes(routes!(admin::update_user_status))
        .routes(routes!(admin::update_user_role))
        .routes(routes!(admin::list_registrations))
        .routes(routes!(admin::approve_registration))
        .routes(routes!(admin::reject_registration))
        .routes(routes!(admin::run_gc))
        .routes(routes!(admin::rebuild_paths))
}
