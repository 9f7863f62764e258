use ndarray::Array2;

/// Binary dilation with a 3x3 square kernel, repeated `iterations` times.
pub fn dilate_mask(mask: &Array2<bool>, iterations: usize) -> Array2<bool> {
    let mut current = mask.clone();
    for _ in 0..iterations {
        current = dilate_once(&current);
    }
    current
}

fn dilate_once(mask: &Array2<bool>) -> Array2<bool> {
    let (h, w) = mask.dim();
    let mut result = Array2::from_elem((h, w), false);

    for row in 0..h {
        for col in 0..w {
            result[[row, col]] = neighbourhood(row, col, h, w).any(|(r, c)| mask[[r, c]]);
        }
    }
    result
}

/// Grow every label into adjacent background pixels, `iterations` times.
///
/// Labelled pixels are never overwritten. A background pixel touching more
/// than one label takes the smallest neighbouring label.
pub fn dilate_labels(labels: &Array2<u32>, iterations: usize) -> Array2<u32> {
    let (h, w) = labels.dim();
    let mut current = labels.clone();
    for _ in 0..iterations {
        let mut next = current.clone();
        let mut changed = false;
        for row in 0..h {
            for col in 0..w {
                if current[[row, col]] != 0 {
                    continue;
                }
                let grown = neighbourhood(row, col, h, w)
                    .map(|(r, c)| current[[r, c]])
                    .filter(|&l| l > 0)
                    .min();
                if let Some(l) = grown {
                    next[[row, col]] = l;
                    changed = true;
                }
            }
        }
        current = next;
        if !changed {
            break;
        }
    }
    current
}

/// In-bounds 3x3 neighbourhood of `(row, col)`, centre included.
fn neighbourhood(
    row: usize,
    col: usize,
    h: usize,
    w: usize,
) -> impl Iterator<Item = (usize, usize)> {
    let rows = row.saturating_sub(1)..(row + 2).min(h);
    rows.flat_map(move |r| (col.saturating_sub(1)..(col + 2).min(w)).map(move |c| (r, c)))
}
