use anyhow::{anyhow, Context, Result};
use log::warn;
use rusqlite::{params, params_from_iter, Row, Transaction};
use serde_json::{from_str, to_string};

use crate::db::{
    connection::Database,
    helpers::{now_ms, placeholders, to_i64, to_u64},
};
use crate::models::{
    Axis3, BufferedRecord, FootData, FootSide, InertialData, Orientation, Reading, ReadingData,
    StreamKind, FOOT_VALUE_COUNT,
};

const SENT_PENDING: i64 = 0;
const SENT_DELIVERED: i64 = 1;
const SENT_QUARANTINED: i64 = 2;

/// SQLite caps bound parameters per statement; stay well below it.
const ID_CHUNK: usize = 500;

fn table(stream: StreamKind) -> &'static str {
    match stream {
        StreamKind::Foot => "foot_readings",
        StreamKind::Inertial => "accel_readings",
    }
}

fn row_to_reading(stream: StreamKind, row: &Row) -> Result<Reading> {
    let timestamp: String = row.get("timestamp")?;
    let device: String = row.get("device")?;

    let data = match stream {
        StreamKind::Foot => {
            let side: String = row.get("foot")?;
            let values_json: String = row.get("values_json")?;
            let values: Vec<f64> =
                from_str(&values_json).context("values_json is not a list of numbers")?;
            if values.len() != FOOT_VALUE_COUNT {
                return Err(anyhow!(
                    "expected {FOOT_VALUE_COUNT} pressure values, found {}",
                    values.len()
                ));
            }
            let active_count: Option<i64> = row.get("active_count")?;

            ReadingData::Foot(FootData {
                foot: FootSide::parse(&side).ok_or_else(|| anyhow!("unknown foot '{side}'"))?,
                max: row.get::<_, Option<f64>>("max_pressure")?.unwrap_or_default(),
                avg: row.get::<_, Option<f64>>("avg_pressure")?.unwrap_or_default(),
                active_count: active_count
                    .map(|count| {
                        u32::try_from(count)
                            .map_err(|_| anyhow!("active_count {count} is out of range"))
                    })
                    .transpose()?
                    .unwrap_or_default(),
                values,
            })
        }
        StreamKind::Inertial => {
            let channel = |name: &str| -> Result<f64> {
                Ok(row.get::<_, Option<f64>>(name)?.unwrap_or_default())
            };
            ReadingData::Inertial(InertialData {
                acc: Axis3 {
                    x: channel("acc_x")?,
                    y: channel("acc_y")?,
                    z: channel("acc_z")?,
                },
                gyro: Axis3 {
                    x: channel("gyro_x")?,
                    y: channel("gyro_y")?,
                    z: channel("gyro_z")?,
                },
                angle: Orientation {
                    roll: channel("roll")?,
                    pitch: channel("pitch")?,
                    yaw: channel("yaw")?,
                },
            })
        }
    };

    Ok(Reading {
        timestamp,
        device,
        data,
    })
}

fn update_sent_flag(
    tx: &Transaction<'_>,
    stream: StreamKind,
    ids: &[i64],
    flag: i64,
) -> Result<usize> {
    let mut changed = 0;
    for chunk in ids.chunks(ID_CHUNK) {
        let sql = format!(
            "UPDATE {} SET sent = ? WHERE sent = {SENT_PENDING} AND id IN ({})",
            table(stream),
            placeholders(chunk.len())
        );
        let params = std::iter::once(flag).chain(chunk.iter().copied());
        changed += tx.execute(&sql, params_from_iter(params))?;
    }
    Ok(changed)
}

impl Database {
    /// Commit one reading and return its id. The write is durable when this resolves.
    pub async fn insert_reading(&self, reading: &Reading) -> Result<i64> {
        let record = reading.clone();
        self.execute(move |conn| {
            let created_at = now_ms();
            match &record.data {
                ReadingData::Foot(foot) => {
                    let values_json =
                        to_string(&foot.values).context("failed to serialize foot values")?;
                    conn.execute(
                        "INSERT INTO foot_readings (
                            timestamp,
                            device,
                            foot,
                            max_pressure,
                            avg_pressure,
                            active_count,
                            values_json,
                            created_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            record.timestamp,
                            record.device,
                            foot.foot.as_str(),
                            foot.max,
                            foot.avg,
                            to_i64(u64::from(foot.active_count))?,
                            values_json,
                            created_at,
                        ],
                    )
                    .context("failed to insert foot reading")?;
                }
                ReadingData::Inertial(imu) => {
                    conn.execute(
                        "INSERT INTO accel_readings (
                            timestamp,
                            device,
                            acc_x, acc_y, acc_z,
                            gyro_x, gyro_y, gyro_z,
                            roll, pitch, yaw,
                            created_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                        params![
                            record.timestamp,
                            record.device,
                            imu.acc.x,
                            imu.acc.y,
                            imu.acc.z,
                            imu.gyro.x,
                            imu.gyro.y,
                            imu.gyro.z,
                            imu.angle.roll,
                            imu.angle.pitch,
                            imu.angle.yaw,
                            created_at,
                        ],
                    )
                    .context("failed to insert accelerometer reading")?;
                }
            }
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Oldest pending rows first. Rows that no longer decode are quarantined in the
    /// same transaction and left out of the result.
    pub async fn fetch_unsent_readings(
        &self,
        stream: StreamKind,
        limit: usize,
    ) -> Result<Vec<BufferedRecord>> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let (records, quarantined) = {
                let sql = format!(
                    "SELECT * FROM {} WHERE sent = {SENT_PENDING} ORDER BY id ASC LIMIT ?1",
                    table(stream)
                );
                let mut stmt = tx.prepare(&sql)?;
                let mut rows = stmt.query(params![to_i64(limit as u64)?])?;

                let mut records = Vec::new();
                let mut quarantined = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: i64 = row.get("id")?;
                    match row_to_reading(stream, row) {
                        Ok(reading) => records.push(BufferedRecord {
                            id,
                            reading,
                            sent: false,
                        }),
                        Err(err) => {
                            warn!("Quarantining {} row {id}: {err:#}", table(stream));
                            quarantined.push(id);
                        }
                    }
                }
                (records, quarantined)
            };

            if !quarantined.is_empty() {
                update_sent_flag(&tx, stream, &quarantined, SENT_QUARANTINED)?;
            }
            tx.commit().context("failed to commit fetch")?;

            Ok(records)
        })
        .await
    }

    /// Flag ids as delivered in one transaction. Already-delivered ids are left alone.
    pub async fn mark_readings_sent(&self, stream: StreamKind, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let changed = update_sent_flag(&tx, stream, &ids, SENT_DELIVERED)?;
            tx.commit().context("failed to commit mark_sent")?;
            Ok(changed)
        })
        .await
    }

    pub async fn delete_sent_readings_before(
        &self,
        stream: StreamKind,
        cutoff_ms: i64,
    ) -> Result<usize> {
        self.execute(move |conn| {
            let sql = format!(
                "DELETE FROM {} WHERE sent = {SENT_DELIVERED} AND created_at <= ?1",
                table(stream)
            );
            let deleted = conn
                .execute(&sql, params![cutoff_ms])
                .context("failed to delete sent readings")?;
            Ok(deleted)
        })
        .await
    }

    pub async fn count_readings(&self, stream: StreamKind, sent: Option<bool>) -> Result<u64> {
        self.execute(move |conn| {
            let filter = match sent {
                Some(true) => format!(" WHERE sent = {SENT_DELIVERED}"),
                Some(false) => format!(" WHERE sent = {SENT_PENDING}"),
                None => String::new(),
            };
            let sql = format!("SELECT COUNT(*) FROM {}{filter}", table(stream));
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            to_u64(count, "count")
        })
        .await
    }

    pub async fn count_quarantined_readings(&self, stream: StreamKind) -> Result<u64> {
        self.execute(move |conn| {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE sent = {SENT_QUARANTINED}",
                table(stream)
            );
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            to_u64(count, "count")
        })
        .await
    }
}
