use sqlx::PgPool;

/// 抢占单行同步锁
///
/// 空闲或持有时间超过 stale_secs 时接管并返回 None; 否则返回当前持有者。
pub async fn acquire_lock(
    pool: &PgPool,
    owner: &str,
    stale_secs: f64,
) -> Result<Option<String>, sqlx::Error> {
    let acquired: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO sync_lock (id, holder, acquired_at)
        VALUES (1, $1, now())
        ON CONFLICT (id) DO UPDATE
            SET holder = EXCLUDED.holder, acquired_at = EXCLUDED.acquired_at
            WHERE sync_lock.acquired_at < now() - make_interval(secs => $2)
        RETURNING holder
        "#
    )
    .bind(owner)
    .bind(stale_secs)
    .fetch_optional(pool)
    .await?;

    if acquired.is_some() {
        return Ok(None);
    }

    let holder: Option<String> = sqlx::query_scalar("SELECT holder FROM sync_lock WHERE id = 1")
        .fetch_optional(pool)
        .await?;

    // 两次查询之间锁被释放: 视为仍被占用, 由调用方稍后重试
    Ok(Some(holder.unwrap_or_else(|| "unknown".to_string())))
}

/// 续期: 刷新 acquired_at, 仅当仍由 owner 持有
pub async fn refresh_lock(pool: &PgPool, owner: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE sync_lock SET acquired_at = now() WHERE id = 1 AND holder = $1")
        .bind(owner)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// 只释放自己持有的锁
pub async fn release_lock(pool: &PgPool, owner: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sync_lock WHERE id = 1 AND holder = $1")
        .bind(owner)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn lock_is_held(pool: &PgPool, stale_secs: f64) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM sync_lock
            WHERE id = 1 AND acquired_at >= now() - make_interval(secs => $1)
        )
        "#
    )
    .bind(stale_secs)
    .fetch_one(pool)
    .await
}
