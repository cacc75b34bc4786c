//! Pagination aggregator
//!
//! Drains a describe call by following continuation tokens. Callers only see
//! the result once every page is in or the first error stops the loop.

use super::{DescribeRequest, Page};
use std::future::Future;

/// Fetch every page for `request`, concatenating items in fetch order
pub async fn collect_pages<T, E, F, Fut>(
    mut request: DescribeRequest,
    mut fetch: F,
) -> Result<Vec<T>, E>
where
    F: FnMut(DescribeRequest) -> Fut,
    Fut: Future<Output = Result<Page<T>, E>>,
{
    let mut items = Vec::new();

    loop {
        let page = fetch(request.clone()).await?;
        items.extend(page.items);

        match page.next_token {
            Some(token) if !token.is_empty() => request.next_token = Some(token),
            _ => return Ok(items),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ApiError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_three_pages_concatenate_in_order() {
        let pages = vec![
            Page {
                items: vec![1, 2],
                next_token: Some("t1".to_string()),
            },
            Page {
                items: vec![3],
                next_token: Some("t2".to_string()),
            },
            Page {
                items: vec![4, 5, 6],
                next_token: Some(String::new()),
            },
        ];
        let seen_tokens = Arc::new(Mutex::new(Vec::new()));
        let tokens = seen_tokens.clone();
        let mut remaining = pages.into_iter();

        let items = collect_pages(DescribeRequest::by_id("vol-1"), |request| {
            tokens.lock().push(request.next_token.clone());
            let page = remaining.next().expect("fetched past the last page");
            async move { Ok::<_, ApiError>(page) }
        })
        .await
        .unwrap();

        assert_eq!(items, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(
            *seen_tokens.lock(),
            vec![None, Some("t1".to_string()), Some("t2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_first_error_stops_loop() {
        let mut calls = 0;

        let result: Result<Vec<u8>, ApiError> =
            collect_pages(DescribeRequest::default(), |_| {
                calls += 1;
                let page = if calls == 1 {
                    Ok(Page {
                        items: vec![1],
                        next_token: Some("more".to_string()),
                    })
                } else {
                    Err(ApiError::new("RequestLimitExceeded", "throttled"))
                };
                async move { page }
            })
            .await;

        assert_eq!(
            result.unwrap_err(),
            ApiError::new("RequestLimitExceeded", "throttled")
        );
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_single_page_without_token() {
        let items: Vec<&str> = collect_pages(DescribeRequest::default(), |_| async {
            Ok::<_, ApiError>(Page::last(vec!["a"]))
        })
        .await
        .unwrap();
        assert_eq!(items, vec!["a"]);
    }
}
