use chrono::Utc;
use gacha_core::{clamp_times, DrawResult, GachaId, Pool, PoolError, SelectionStrategy, UserId};
use rand::Rng;
use rusqlite::Connection;
use thiserror::Error;

use crate::store;

#[derive(Debug, Error)]
pub enum RollError {
    #[error("gacha not found")]
    GachaNotFound,
    #[error("{0}")]
    NoItems(#[from] PoolError),
    #[error("storage failure: {0}")]
    Persistence(#[from] rusqlite::Error),
}

/// Draw `times` items from the gacha's flat weighted pool and record one
/// roll row per draw inside a single transaction. Either every draw of the
/// batch is persisted or none is; no partial results are ever returned.
pub fn execute_roll<R: Rng>(
    conn: &mut Connection,
    rng: &mut R,
    gacha_id: GachaId,
    user_id: UserId,
    times: i64,
) -> Result<Vec<DrawResult>, RollError> {
    let times = clamp_times(times);

    let gacha = store::get_gacha(conn, gacha_id)?.ok_or(RollError::GachaNotFound)?;
    let items = store::get_items(conn, gacha_id)?;
    let pool = Pool::build(SelectionStrategy::FlatWeight, &gacha.rarity_rates, &items)?;

    // One transaction for the whole batch: dropping it on any error path
    // rolls every insert back.
    let tx = conn.transaction()?;
    let mut results = Vec::with_capacity(times as usize);
    for _ in 0..times {
        let pick = pool.draw(rng);
        store::insert_roll(
            &tx,
            user_id,
            gacha_id,
            pick.id,
            &pick.rarity,
            &Utc::now().to_rfc3339(),
        )?;
        results.push(DrawResult::of(pick, gacha_id));
    }
    tx.commit()?;
    Ok(results)
}

/// Tier-first draw over the same catalog, without touching roll history.
/// This is the client-preview selection mode; its distribution follows the
/// gacha's rarity rates, not the item weights.
pub fn preview_roll<R: Rng>(
    conn: &Connection,
    rng: &mut R,
    gacha_id: GachaId,
    times: i64,
) -> Result<Vec<DrawResult>, RollError> {
    let times = clamp_times(times);

    let gacha = store::get_gacha(conn, gacha_id)?.ok_or(RollError::GachaNotFound)?;
    let items = store::get_items(conn, gacha_id)?;
    let pool = Pool::build(SelectionStrategy::TierFirst, &gacha.rarity_rates, &items)?;

    Ok((0..times)
        .map(|_| DrawResult::of(pool.draw(rng), gacha_id))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GachaMeta, NewItem};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const USER: UserId = 7;

    fn seeded_gacha(conn: &mut Connection, items: &[(&str, i64)]) -> GachaId {
        let meta = GachaMeta {
            title: "test gacha".into(),
            description: None,
            category: None,
            thumbnail: None,
            rarity_rates: [("N".to_string(), 60.0), ("SSR".to_string(), 40.0)]
                .into_iter()
                .collect(),
        };
        let rows: Vec<NewItem> = items
            .iter()
            .map(|(rarity, weight)| NewItem {
                name: format!("{rarity}-{weight}"),
                rarity: rarity.to_string(),
                img_src: None,
                weight: *weight,
            })
            .collect();
        store::create_gacha(conn, &meta, USER, &rows).unwrap()
    }

    #[test]
    fn returns_one_result_per_draw_and_persists_all() {
        let mut conn = store::open_in_memory().unwrap();
        let gacha_id = seeded_gacha(&mut conn, &[("N", 1), ("SSR", 3)]);
        let mut rng = ChaCha8Rng::seed_from_u64(2);

        let results = execute_roll(&mut conn, &mut rng, gacha_id, USER, 4).unwrap();

        assert_eq!(results.len(), 4);
        let item_ids: Vec<_> = store::get_items(&conn, gacha_id)
            .unwrap()
            .iter()
            .map(|it| it.id)
            .collect();
        for res in &results {
            assert!(item_ids.contains(&res.item_id));
            assert_eq!(res.gacha_id, gacha_id);
        }
        assert_eq!(store::count_rolls(&conn, gacha_id).unwrap(), 4);

        let recorded_for_user: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM gacha_rolls WHERE gacha_id = ? AND user_id = ?",
                [gacha_id, USER],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(recorded_for_user, 4);
    }

    #[test]
    fn clamps_times_below_and_above_bounds() {
        let mut conn = store::open_in_memory().unwrap();
        let gacha_id = seeded_gacha(&mut conn, &[("N", 1)]);
        let mut rng = ChaCha8Rng::seed_from_u64(4);

        let low = execute_roll(&mut conn, &mut rng, gacha_id, USER, 0).unwrap();
        assert_eq!(low.len(), 1);

        let high = execute_roll(&mut conn, &mut rng, gacha_id, USER, 500).unwrap();
        assert_eq!(high.len(), 100);

        assert_eq!(store::count_rolls(&conn, gacha_id).unwrap(), 101);
    }

    #[test]
    fn unknown_gacha_writes_nothing() {
        let mut conn = store::open_in_memory().unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(6);

        let err = execute_roll(&mut conn, &mut rng, 404, USER, 3).unwrap_err();
        assert!(matches!(err, RollError::GachaNotFound));
        assert_eq!(store::count_rolls(&conn, 404).unwrap(), 0);
    }

    #[test]
    fn empty_item_set_writes_nothing() {
        let mut conn = store::open_in_memory().unwrap();
        let gacha_id = seeded_gacha(&mut conn, &[]);
        let mut rng = ChaCha8Rng::seed_from_u64(8);

        let err = execute_roll(&mut conn, &mut rng, gacha_id, USER, 3).unwrap_err();
        assert!(matches!(err, RollError::NoItems(PoolError::NoItemsAvailable)));
        assert_eq!(store::count_rolls(&conn, gacha_id).unwrap(), 0);
    }

    #[test]
    fn mid_batch_failure_rolls_back_the_whole_batch() {
        let mut conn = store::open_in_memory().unwrap();
        let gacha_id = seeded_gacha(&mut conn, &[("N", 1), ("SSR", 3)]);
        // Abort the third insert of the batch.
        conn.execute_batch(
            "CREATE TRIGGER abort_third_roll BEFORE INSERT ON gacha_rolls
             WHEN (SELECT COUNT(*) FROM gacha_rolls) >= 2
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(10);

        let err = execute_roll(&mut conn, &mut rng, gacha_id, USER, 5).unwrap_err();
        assert!(matches!(err, RollError::Persistence(_)));
        assert_eq!(store::count_rolls(&conn, gacha_id).unwrap(), 0);
    }

    #[test]
    fn draw_frequency_follows_item_weights() {
        let mut conn = store::open_in_memory().unwrap();
        let gacha_id = seeded_gacha(&mut conn, &[("N", 1), ("SSR", 3)]);
        let mut rng = ChaCha8Rng::seed_from_u64(12);

        let heavy_id = store::get_items(&conn, gacha_id)
            .unwrap()
            .iter()
            .find(|it| it.weight == 3)
            .unwrap()
            .id;

        let mut heavy = 0usize;
        let batches = 100;
        for _ in 0..batches {
            for res in execute_roll(&mut conn, &mut rng, gacha_id, USER, 100).unwrap() {
                if res.item_id == heavy_id {
                    heavy += 1;
                }
            }
        }

        let draws = (batches * 100) as f64;
        let freq = heavy as f64 / draws;
        assert!(
            (freq - 0.75).abs() < 0.02,
            "weight-3 item should win ~3 of 4 draws, got {freq}"
        );
        assert_eq!(store::count_rolls(&conn, gacha_id).unwrap(), draws as i64);
    }

    #[test]
    fn preview_draws_by_tier_and_never_persists() {
        let mut conn = store::open_in_memory().unwrap();
        let meta = GachaMeta {
            title: "preview".into(),
            description: None,
            category: None,
            thumbnail: None,
            // All the rate mass on N; SSR items exist but stay unreachable.
            rarity_rates: [
                ("N".to_string(), 100.0),
                ("SSR".to_string(), 0.0),
            ]
            .into_iter()
            .collect(),
        };
        let items = vec![
            NewItem {
                name: "common".into(),
                rarity: "N".into(),
                img_src: None,
                weight: 1,
            },
            NewItem {
                name: "rare".into(),
                rarity: "SSR".into(),
                img_src: None,
                weight: 50,
            },
        ];
        let gacha_id = store::create_gacha(&mut conn, &meta, USER, &items).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(14);

        let results = preview_roll(&conn, &mut rng, gacha_id, 50).unwrap();
        assert_eq!(results.len(), 50);
        for res in &results {
            assert_eq!(res.rarity, "N");
        }
        assert_eq!(store::count_rolls(&conn, gacha_id).unwrap(), 0);
    }

    #[test]
    fn preview_rejects_unknown_and_empty_gachas() {
        let mut conn = store::open_in_memory().unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(16);

        let err = preview_roll(&conn, &mut rng, 404, 1).unwrap_err();
        assert!(matches!(err, RollError::GachaNotFound));

        let gacha_id = seeded_gacha(&mut conn, &[]);
        let err = preview_roll(&conn, &mut rng, gacha_id, 1).unwrap_err();
        assert!(matches!(err, RollError::NoItems(_)));
    }
}
