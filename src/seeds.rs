//! Daily server-seed registry.
//!
//! One committed seed per calendar day: the SHA-256 hash is public from
//! the moment the seed exists, the seed itself is revealed once its day
//! is strictly in the past. Past seeds are immutable; future seeds may be
//! created ahead of time or deleted by the admin surface.

use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use tracing::*;

use crate::{
    error::{Error, Result},
    fair,
    store::{
        models::{SeedId, ServerSeed},
        Inserted, Store,
    },
};

/// How many days past today the public view reaches forward.
const VIEW_FORWARD_DAYS: u64 = 3;

pub struct SeedRegistry {
    store: Arc<Store>,
}

/// One seed as disclosed on the fairness page. The raw seed is present
/// only for dates strictly before today.
#[derive(Clone, Debug, Serialize)]
pub struct PublicSeed {
    pub seed_id: SeedId,
    pub seed_date: NaiveDate,
    pub server_seed_hash: String,
    pub server_seed: Option<String>,
    pub bet_count: u64,
}

/// Payload of the public fairness view.
#[derive(Clone, Debug, Serialize)]
pub struct FairnessView {
    pub seeds: Vec<PublicSeed>,
    pub today: NaiveDate,
    pub three_days_later: NaiveDate,
}

impl SeedRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        SeedRegistry { store }
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    /// Returns today's seed, creating it atomically on first use. The
    /// uniqueness index on the date guarantees at-most-one concurrent
    /// creation; a losing writer reads the winner's seed.
    pub fn get_or_create_today(&self) -> Result<Inserted<ServerSeed>> {
        self.get_or_create_for(Self::today())
    }

    fn get_or_create_for(&self, date: NaiveDate) -> Result<Inserted<ServerSeed>> {
        if let Some(existing) = self.store.server_seed_by_date(date)? {
            return Ok(Inserted::Existing(existing));
        }
        let server_seed = fair::generate_server_seed();
        let seed = ServerSeed {
            id: SeedId(self.store.alloc_id()?),
            seed_date: date,
            server_seed_hash: fair::seed_hash(&server_seed),
            server_seed,
            bet_count: 0,
            created_at: Utc::now(),
        };
        let inserted = self.store.insert_server_seed(seed)?;
        if let Inserted::Created(seed) = &inserted {
            info!(
                date = %seed.seed_date,
                hash = %seed.server_seed_hash,
                "committed new daily server seed"
            );
        }
        Ok(inserted)
    }

    /// Counts a bet against a seed and returns the updated record; the
    /// caller uses `bet_count == 1` to detect the first bet of the day.
    pub fn record_bet(&self, id: SeedId) -> Result<ServerSeed> {
        self.store.update_server_seed(id, |seed| seed.bet_count += 1)
    }

    /// Seeds for dates in `[today − window_days, today + 3]`, newest
    /// first. Ensures today's seed exists so the view always carries a
    /// live commitment.
    pub fn public_view(&self, window_days: i64) -> Result<FairnessView> {
        let today = Self::today();
        let horizon = today + Days::new(VIEW_FORWARD_DAYS);
        let floor = today - Days::new(window_days.max(0) as u64);

        self.get_or_create_today()?;

        let mut seeds: Vec<PublicSeed> = self
            .store
            .all_server_seeds()?
            .into_iter()
            .filter(|seed| seed.seed_date >= floor && seed.seed_date <= horizon)
            .map(|seed| {
                let revealed = seed.seed_date < today;
                PublicSeed {
                    seed_id: seed.id,
                    seed_date: seed.seed_date,
                    server_seed_hash: seed.server_seed_hash,
                    server_seed: revealed.then_some(seed.server_seed),
                    bet_count: seed.bet_count,
                }
            })
            .collect();
        seeds.sort_by(|a, b| b.seed_date.cmp(&a.seed_date));

        Ok(FairnessView {
            seeds,
            today,
            three_days_later: horizon,
        })
    }

    /// Admin creation of a seed for a future date. Today's and past dates
    /// are refused: their seeds are created by the pipeline or already
    /// immutable.
    pub fn admin_create(&self, date: NaiveDate) -> Result<ServerSeed> {
        if date <= Self::today() {
            return Err(Error::user(format!(
                "seed for {date} is not in the future"
            )));
        }
        match self.get_or_create_for(date)? {
            Inserted::Created(seed) => Ok(seed),
            Inserted::Existing(_) => {
                Err(Error::user(format!("server seed already exists for {date}")))
            }
        }
    }

    /// Admin deletion; only future-dated seeds are deletable. A revealed
    /// (past) seed never changes and never disappears.
    pub fn admin_delete(&self, id: SeedId) -> Result<bool> {
        let seed = self.store.server_seed(id)?;
        if seed.seed_date <= Self::today() {
            return Err(Error::user(format!(
                "seed for {} is immutable",
                seed.seed_date
            )));
        }
        self.store.delete_server_seed(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Days;

    fn registry() -> SeedRegistry {
        SeedRegistry::new(Arc::new(Store::open_temporary().unwrap()))
    }

    #[test]
    fn today_is_created_once_and_stable() {
        let registry = registry();
        let first = registry.get_or_create_today().unwrap();
        assert!(first.was_created());
        let first = first.into_inner();
        let second = registry.get_or_create_today().unwrap();
        assert!(!second.was_created());
        let second = second.into_inner();
        assert_eq!(first.id, second.id);
        assert_eq!(first.server_seed, second.server_seed);
        assert_eq!(fair::seed_hash(&first.server_seed), first.server_seed_hash);
    }

    #[test]
    fn public_view_reveals_only_past_seeds() {
        let registry = registry();
        let today = Utc::now().date_naive();

        // Seed an old day directly (the pipeline would have made it).
        let old = ServerSeed {
            id: SeedId(registry.store.alloc_id().unwrap()),
            seed_date: today - Days::new(1),
            server_seed: "yesterdays-seed".into(),
            server_seed_hash: fair::seed_hash("yesterdays-seed"),
            bet_count: 12,
            created_at: Utc::now(),
        };
        registry.store.insert_server_seed(old).unwrap();
        registry.admin_create(today + Days::new(2)).unwrap();

        let view = registry.public_view(30).unwrap();
        assert_eq!(view.today, today);
        assert_eq!(view.three_days_later, today + Days::new(3));
        assert_eq!(view.seeds.len(), 3);
        // Newest first.
        assert!(view
            .seeds
            .windows(2)
            .all(|w| w[0].seed_date > w[1].seed_date));

        for seed in &view.seeds {
            if seed.seed_date < today {
                assert_eq!(seed.server_seed.as_deref(), Some("yesterdays-seed"));
            } else {
                assert!(seed.server_seed.is_none(), "unrevealed seed leaked");
            }
            assert_eq!(seed.server_seed_hash.len(), 64);
        }
    }

    #[test]
    fn calendar_is_future_only() {
        let registry = registry();
        let today = Utc::now().date_naive();

        assert!(registry.admin_create(today).is_err());
        assert!(registry.admin_create(today - Days::new(1)).is_err());

        let future = registry.admin_create(today + Days::new(2)).unwrap();
        // Duplicate creation is refused.
        assert!(registry.admin_create(today + Days::new(2)).is_err());
        // Future seeds are deletable, once.
        assert!(registry.admin_delete(future.id).unwrap());

        // Past and current seeds are not.
        let todays = registry.get_or_create_today().unwrap().into_inner();
        assert!(registry.admin_delete(todays.id).is_err());
    }

    #[test]
    fn bet_count_increments() {
        let registry = registry();
        let seed = registry.get_or_create_today().unwrap().into_inner();
        assert_eq!(registry.record_bet(seed.id).unwrap().bet_count, 1);
        assert_eq!(registry.record_bet(seed.id).unwrap().bet_count, 2);
    }
}
