use axum::http::{Method, Uri};

use crate::error::{Error, ErrorDetails};

pub async fn handle_404(method: Method, uri: Uri) -> Error {
    Error::new(ErrorDetails::RouteNotFound {
        path: uri.path().to_string(),
        method: method.to_string(),
    })
}
