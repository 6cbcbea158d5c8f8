//! Paged ROM listing

use crate::{Result, Rom, RomQuery, RommApi};

/// Fetch every ROM matching `query`, one page of `page_size` at a time.
///
/// Stops on a short page or once `total` rows have been accumulated.
/// `on_page` receives the size of each page as it arrives.
pub async fn fetch_all_roms(
    api: &dyn RommApi,
    query: &RomQuery,
    page_size: i64,
    mut on_page: impl FnMut(usize) + Send,
) -> Result<Vec<Rom>> {
    let page_size = page_size.max(1);
    let mut roms = Vec::new();
    let mut offset = 0;

    loop {
        let page = api.roms(&query.clone().page(offset, page_size)).await?;
        let returned = page.items.len();
        on_page(returned);
        roms.extend(page.items);
        offset += returned as i64;

        let short_page = (returned as i64) < page_size;
        let complete = page.total > 0 && roms.len() as i64 >= page.total;
        if short_page || complete {
            break;
        }
    }

    Ok(roms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRomm;

    #[tokio::test]
    async fn test_paginates_until_short_page() {
        let mock = MockRomm::new();
        for id in 1..=5 {
            mock.add_rom(id, 1, "snes", &format!("Game {id}"));
        }

        let mut pages = Vec::new();
        let roms = fetch_all_roms(&mock, &RomQuery::for_platform(1), 2, |n| pages.push(n))
            .await
            .unwrap();

        assert_eq!(roms.len(), 5);
        assert_eq!(pages, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_empty_platform_fetches_once() {
        let mock = MockRomm::new();
        let roms = fetch_all_roms(&mock, &RomQuery::for_platform(2), 200, |_| {})
            .await
            .unwrap();

        assert!(roms.is_empty());
        assert_eq!(mock.call_count("roms"), 1);
    }
}
